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

//! In-process batching and checkpoint engine for a connector runtime.
//!
//! Incoming change records are buffered into size/count/time-bounded
//! batches ("aggregates"), published to a destination writer under a
//! bounded-memory backpressure policy, and a checkpoint is only reported as
//! safely processed once every record it covers has been durably flushed.
//!
//! The engine is a fixed chain of actor stages per input shard:
//!
//! ```text
//! source -> parse -> aggregation -> flush (pool) -> state tracking -> sink
//! ```
//!
//! Stages are connected by bounded channels; when the destination is slow
//! the closed-aggregate buffer fills up and the aggregation stage blocks,
//! propagating the slowness all the way back to the input reader instead of
//! growing memory. Wire parsing, destination I/O, transports and config
//! loading live behind the collaborator traits in [`collaborators`].

pub mod aggregate;
pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod message;
pub mod pipeline;
pub mod stores;

pub use config::{PipelineConfig, TriggerConfig};
pub use message::{ChangeRecord, Checkpoint, EnrichedCheckpoint, SourceItem};
pub use pipeline::{PipelineState, PipelineSupervisorHandle};
pub use stores::StatsRegistry;

use collaborators::{CheckpointSink, DestinationWriter, RecordSource};
use std::sync::Arc;
use stores::EmittedCoverageProvider;
use tokio::task::JoinHandle;

/// Start a pipeline with the default stats stores and the emitted-count
/// coverage bookkeeper. One source per input shard; the destination and the
/// checkpoint sink are shared.
pub fn start_pipeline<S, D, K>(
    config: PipelineConfig,
    sources: Vec<S>,
    writer: Arc<D>,
    sink: Arc<K>,
    meter: opentelemetry::metrics::Meter,
) -> Result<
    (
        JoinHandle<anyhow::Result<String>>,
        PipelineSupervisorHandle,
        Arc<StatsRegistry>,
    ),
    config::ConfigurationError,
>
where
    S: RecordSource,
    D: DestinationWriter,
    K: CheckpointSink,
{
    let stores = Arc::new(StatsRegistry::new(config.additional_metrics.clone()));
    let coverage = Arc::new(EmittedCoverageProvider::new(stores.emitted.clone()));
    let (join, handle) = PipelineSupervisorHandle::new(
        config,
        sources,
        writer,
        sink,
        coverage,
        stores.clone(),
        either::Either::Left(meter),
    )?;
    Ok((join, handle, stores))
}
