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

//! The actor-based stage chain: parse -> aggregation -> flush -> state
//! tracking, supervised per input shard.

mod aggregation;
mod flush;
mod parse;
mod state_tracker;
mod supervisor;

pub use aggregation::{AggregationActorHandle, AggregationCommand, AggregationStats};
pub use flush::{FlushActorHandle, FlushStats, FlushWorkerCommand};
pub use parse::{ParseActorHandle, ParseCommand, ParseStats};
pub use state_tracker::{
    FlushNotice, StateEvent, StateTrackerCommand, StateTrackerHandle, StateTrackerStats,
};
pub use supervisor::{PipelineState, PipelineSupervisorHandle, SupervisorStats};

#[cfg(test)]
mod tests;
