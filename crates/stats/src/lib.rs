// Copyright (C) 2025-present The Sluice Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Mergeable emission counters and the shared stats stores used by the
//! Sluice batching engine.
//!
//! The crate is intentionally dependency-light; it holds the leaf data
//! model shared by every pipeline stage:
//! - [`histogram::Histogram`] - a mergeable counter map (not a statistical
//!   bucket histogram)
//! - [`emission::EmissionStats`] / [`emission::PartitionStats`] - `{count,
//!   bytes}` pairs with associative merge
//! - [`store`] - the concurrency-safe stores tracking emitted vs. committed
//!   counts and auxiliary per-partition metrics

pub mod emission;
pub mod histogram;
pub mod store;

pub use emission::{EmissionStats, PartitionStats};
pub use histogram::{Histogram, PartitionHistogram, PartitionKey, StreamKey};
