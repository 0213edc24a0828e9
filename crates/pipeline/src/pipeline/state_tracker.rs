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

//! State-stage actor: matches flushed partitions against pending
//! checkpoints and releases fully covered ones, enriched with their
//! committed stats, in registration order.

use crate::{
    checkpoint::{CheckpointEnricher, CheckpointRegistry},
    collaborators::CheckpointSink,
    message::{Checkpoint, CheckpointCoverage},
};
use opentelemetry::metrics::{Counter, Meter};
use rustc_hash::FxHashSet;
use sluice_stats::{store::EmissionStatsStore, EmissionStats, StreamKey};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, trace, warn};

/// Report from the flush stage that one aggregate's partitions were
/// committed to the destination.
#[derive(Debug, Clone)]
pub struct FlushNotice {
    pub stream: StreamKey,
    pub aggregate_index: u64,
    pub stats: EmissionStats,
}

/// Everything the state stage reacts to.
#[derive(Debug)]
pub enum StateEvent {
    Register {
        checkpoint: Checkpoint,
        coverage: CheckpointCoverage,
    },
    Flushed(FlushNotice),
}

#[derive(Debug, Clone)]
pub struct StateTrackerStats {
    pub registered_checkpoints: Counter<u64>,
    pub released_checkpoints: Counter<u64>,
    pub flush_notices: Counter<u64>,
    pub dropped_checkpoints: Counter<u64>,
}

impl StateTrackerStats {
    pub fn new(meter: Meter) -> Self {
        let registered_checkpoints = meter
            .u64_counter("sluice.pipeline.state.registered.checkpoints")
            .with_description("Number of checkpoints registered for release tracking")
            .build();
        let released_checkpoints = meter
            .u64_counter("sluice.pipeline.state.released.checkpoints")
            .with_description("Number of checkpoints released to the output")
            .build();
        let flush_notices = meter
            .u64_counter("sluice.pipeline.state.flush.notices")
            .with_description("Number of flush notices processed")
            .build();
        let dropped_checkpoints = meter
            .u64_counter("sluice.pipeline.state.dropped.checkpoints")
            .with_description("Number of pending checkpoints dropped on abort")
            .build();
        Self {
            registered_checkpoints,
            released_checkpoints,
            flush_notices,
            dropped_checkpoints,
        }
    }
}

#[derive(Debug, Clone, Copy, strum_macros::Display)]
pub enum StateTrackerCommand {
    Shutdown,
    /// Drop pending checkpoints and discard the live stats of every stream
    /// this instance touched. Used when the instance failed.
    Abort,
}

struct StateTrackerActor<K> {
    cmd_rx: mpsc::Receiver<StateTrackerCommand>,
    rx: async_channel::Receiver<StateEvent>,
    registry: CheckpointRegistry,
    enricher: CheckpointEnricher,
    committed: Arc<EmissionStatsStore>,
    per_stream: Arc<sluice_stats::store::PerStreamStatsStore>,
    sink: Arc<K>,
    stats: StateTrackerStats,
    shard_id: usize,
    seen_streams: FxHashSet<StreamKey>,
}

impl<K: CheckpointSink> StateTrackerActor<K> {
    async fn run(mut self) -> anyhow::Result<String> {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(StateTrackerCommand::Abort) => {
                            self.abort();
                            return Ok("State tracking aborted".to_string());
                        }
                        Some(StateTrackerCommand::Shutdown) => {
                            info!("Received shutdown command, shutting down StateTrackerActor");
                        }
                        None => {
                            info!("Command channel closed, shutting down StateTrackerActor");
                        }
                    }
                    return Ok("State tracking terminated successfully".to_string());
                }
                event = self.rx.recv() => {
                    match event {
                        Ok(StateEvent::Register { checkpoint, coverage }) => {
                            self.per_stream.observe_scope(checkpoint.scope());
                            for entry in coverage.iter() {
                                self.seen_streams.insert(entry.stream.clone());
                            }
                            debug!(
                                "Registered checkpoint {} covering {} partitions",
                                checkpoint.id(),
                                coverage.len()
                            );
                            self.stats.registered_checkpoints.add(1, &self.tags());
                            self.registry.register(checkpoint, coverage);
                            self.release().await?;
                        }
                        Ok(StateEvent::Flushed(notice)) => {
                            trace!(
                                "Aggregate {} for stream {} committed: {}",
                                notice.aggregate_index, notice.stream, notice.stats
                            );
                            self.stats.flush_notices.add(1, &self.tags());
                            self.seen_streams.insert(notice.stream.clone());
                            self.release().await?;
                        }
                        Err(_) => {
                            // Every upstream sender is gone; whatever could
                            // release has had its chance.
                            self.release().await?;
                            let pending = self.registry.pending_count();
                            if pending > 0 {
                                return Err(anyhow::anyhow!(
                                    "{pending} checkpoints remain unaccounted after drain on shard {}",
                                    self.shard_id
                                ));
                            }
                            return Ok("State tracking drained".to_string());
                        }
                    }
                }
            }
        }
    }

    fn tags(&self) -> [opentelemetry::KeyValue; 1] {
        [opentelemetry::KeyValue::new(
            "shard_id",
            opentelemetry::Value::I64(self.shard_id as i64),
        )]
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        let ready = self.registry.release_ready(&self.committed)?;
        for (checkpoint, coverage) in ready {
            let id = checkpoint.id();
            let enriched = self.enricher.enrich(checkpoint, coverage)?;
            self.sink
                .emit(enriched)
                .await
                .map_err(|err| anyhow::anyhow!("checkpoint sink failed: {err}"))?;
            self.stats.released_checkpoints.add(1, &self.tags());
            debug!("Released checkpoint {id}");
        }
        Ok(())
    }

    fn abort(&mut self) {
        let dropped = self.registry.drain_pending();
        if !dropped.is_empty() {
            warn!(
                "Dropping {} pending checkpoints on shard {} abort",
                dropped.len(),
                self.shard_id
            );
            self.stats
                .dropped_checkpoints
                .add(dropped.len() as u64, &self.tags());
        }
        for stream in &self.seen_streams {
            let discarded = self.committed.discard_live(stream);
            if !discarded.is_empty() {
                warn!("Discarded uncommitted stats for stream {stream}: {discarded}");
            }
        }
    }
}

#[derive(Debug)]
pub enum StateTrackerHandleError {
    SendError,
}

impl std::fmt::Display for StateTrackerHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to state tracker"),
        }
    }
}

impl std::error::Error for StateTrackerHandleError {}

#[derive(Debug, Clone)]
pub struct StateTrackerHandle {
    cmd_tx: mpsc::Sender<StateTrackerCommand>,
}

impl StateTrackerHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new<K: CheckpointSink>(
        rx: async_channel::Receiver<StateEvent>,
        enricher: CheckpointEnricher,
        committed: Arc<EmissionStatsStore>,
        per_stream: Arc<sluice_stats::store::PerStreamStatsStore>,
        sink: Arc<K>,
        stats: either::Either<Meter, StateTrackerStats>,
        shard_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let stats = match stats {
            either::Either::Left(meter) => StateTrackerStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = StateTrackerActor {
            cmd_rx,
            rx,
            registry: CheckpointRegistry::new(),
            enricher,
            committed,
            per_stream,
            sink,
            stats,
            shard_id,
            seen_streams: FxHashSet::default(),
        };
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_tx })
    }

    pub async fn shutdown(&self) -> Result<(), StateTrackerHandleError> {
        self.cmd_tx
            .send(StateTrackerCommand::Shutdown)
            .await
            .map_err(|_| StateTrackerHandleError::SendError)
    }

    pub async fn abort(&self) -> Result<(), StateTrackerHandleError> {
        self.cmd_tx
            .send(StateTrackerCommand::Abort)
            .await
            .map_err(|_| StateTrackerHandleError::SendError)
    }
}
