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

//! Aggregate buffering: the per-shard registry of open batches and the
//! trigger policy deciding when each one closes.

mod batch;
mod estimator;
mod store;
mod trigger;

pub use batch::{Aggregate, CloseReason};
pub use estimator::{EstimationError, JsonSizeEstimator, SizeEstimator};
pub use store::AggregateStore;
pub use trigger::TriggerPolicy;
