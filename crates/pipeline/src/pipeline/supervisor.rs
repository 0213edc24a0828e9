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

//! # Pipeline Supervisor Module
//!
//! Spawns one stage chain (parse -> aggregation -> flush -> state) per
//! input shard and drives each instance through its lifecycle:
//!
//! ```text
//! Init -> Running -> Draining -> Completed
//!            \----------------> Failed
//! ```
//!
//! `Draining` starts when the shard's input reaches end-of-stream: the
//! record channels close stage by stage, each stage flushes what it holds
//! and exits, so in-flight flush and state work finishes before the shard
//! reports `Completed`. A stage error fails only its own shard: the
//! remaining stages of that shard are cancelled cooperatively at safe
//! points, pending checkpoints are dropped and the shard's uncommitted
//! stats are discarded. Sibling shards are unaffected.

use crate::{
    aggregate::{AggregateStore, JsonSizeEstimator, TriggerPolicy},
    checkpoint::CheckpointEnricher,
    collaborators::{CheckpointSink, CoverageProvider, DestinationWriter, RecordSource},
    config::{ConfigurationError, PipelineConfig},
    pipeline::{
        aggregation::AggregationActorHandle, flush::FlushActorHandle, parse::ParseActorHandle,
        state_tracker::StateTrackerHandle,
    },
    stores::StatsRegistry,
};
use opentelemetry::metrics::{Counter, Meter};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Lifecycle of one pipeline instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum PipelineState {
    Init,
    Running,
    Draining,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub shards_completed: Counter<u64>,
    pub shards_failed: Counter<u64>,
}

impl SupervisorStats {
    pub fn new(meter: Meter) -> Self {
        let shards_completed = meter
            .u64_counter("sluice.pipeline.supervisor.shards.completed")
            .with_description("Number of shard pipelines that completed cleanly")
            .build();
        let shards_failed = meter
            .u64_counter("sluice.pipeline.supervisor.shards.failed")
            .with_description("Number of shard pipelines that terminated with an error")
            .build();
        Self {
            shards_completed,
            shards_failed,
        }
    }
}

#[derive(Debug, strum_macros::Display)]
enum SupervisorCommand {
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
struct ShardHandles {
    parse: ParseActorHandle,
    aggregations: Vec<AggregationActorHandle>,
    flushes: Vec<FlushActorHandle>,
    state: StateTrackerHandle,
}

type StageJoin = (&'static str, JoinHandle<anyhow::Result<String>>);

fn spawn_shard<S, D, K, C>(
    shard_id: usize,
    config: &PipelineConfig,
    source: S,
    writer: Arc<D>,
    sink: Arc<K>,
    coverage: Arc<C>,
    stores: &StatsRegistry,
    meter: Meter,
) -> (ShardHandles, Vec<StageJoin>)
where
    S: RecordSource,
    D: DestinationWriter,
    K: CheckpointSink,
    C: CoverageProvider,
{
    let mut joins = Vec::new();

    let (state_tx, state_rx) = async_channel::bounded(config.buffer_size);
    // The single chokepoint bounding closed-but-unflushed aggregates.
    let (closed_tx, closed_rx) =
        async_channel::bounded(config.trigger.max_buffered_aggregates);

    let mut record_txs = Vec::new();
    let mut aggregations = Vec::new();
    for worker_id in 0..config.aggregate_workers {
        let (record_tx, record_rx) = async_channel::bounded(config.buffer_size);
        record_txs.push(record_tx);
        let store = AggregateStore::new(
            TriggerPolicy::from_config(&config.trigger),
            JsonSizeEstimator,
        );
        let (join, handle) = AggregationActorHandle::new(
            store,
            config.sweep_interval,
            record_rx,
            closed_tx.clone(),
            either::Either::Left(meter.clone()),
            shard_id,
            worker_id,
        );
        joins.push(("aggregation", join));
        aggregations.push(handle);
    }
    drop(closed_tx);

    let mut flushes = Vec::new();
    for worker_id in 0..config.flush_workers {
        let (join, handle) = FlushActorHandle::new(
            writer.clone(),
            stores.committed.clone(),
            stores.metrics.clone(),
            stores.additional.clone(),
            closed_rx.clone(),
            state_tx.clone(),
            config.flush_retry_backoff,
            either::Either::Left(meter.clone()),
            shard_id,
            worker_id,
        );
        joins.push(("flush", join));
        flushes.push(handle);
    }
    drop(closed_rx);

    let enricher = CheckpointEnricher::new(
        stores.committed.clone(),
        stores.per_stream.clone(),
        stores.metrics.clone(),
        stores.additional.clone(),
    );
    let (state_join, state) = StateTrackerHandle::new(
        state_rx,
        enricher,
        stores.committed.clone(),
        stores.per_stream.clone(),
        sink,
        either::Either::Left(meter.clone()),
        shard_id,
    );
    joins.push(("state", state_join));

    let (parse_join, parse) = ParseActorHandle::new(
        source,
        coverage,
        stores.emitted.clone(),
        record_txs,
        state_tx,
        either::Either::Left(meter),
        shard_id,
    );
    joins.push(("parse", parse_join));

    (
        ShardHandles {
            parse,
            aggregations,
            flushes,
            state,
        },
        joins,
    )
}

/// Cooperatively cancel every stage of one shard: stop pulling input,
/// force-flush buffered aggregates best-effort, stop the flush pool and
/// abort state tracking.
async fn cancel_shard(handles: &ShardHandles) {
    let _ = handles.parse.shutdown().await;
    for handle in &handles.aggregations {
        match tokio::time::timeout(Duration::from_secs(2), handle.flush_all()).await {
            Ok(Ok(count)) => debug!("Force-flushed {count} aggregates during cancellation"),
            _ => warn!("Could not force-flush aggregates during cancellation"),
        }
        let _ = handle.shutdown().await;
    }
    for handle in &handles.flushes {
        let _ = handle.shutdown().await;
    }
    let _ = handles.state.abort().await;
}

/// Drive one shard's stage chain to completion.
async fn run_shard(
    shard_id: usize,
    handles: ShardHandles,
    joins: Vec<StageJoin>,
    watch_tx: watch::Sender<PipelineState>,
) -> anyhow::Result<String> {
    watch_tx.send_replace(PipelineState::Running);
    let (mut labels, mut join_handles): (Vec<&'static str>, Vec<_>) = joins.into_iter().unzip();
    let mut failure: Option<anyhow::Error> = None;

    while !join_handles.is_empty() {
        let waiter = futures::future::select_all(join_handles.iter_mut());
        let completed = if failure.is_some() {
            // Already cancelling; do not wait forever on a stage stuck in
            // collaborator I/O.
            match tokio::time::timeout(Duration::from_secs(5), waiter).await {
                Ok(completed) => completed,
                Err(_) => {
                    warn!("[shard {shard_id}] Timed out waiting for cancelled stages, aborting them");
                    for handle in join_handles.iter() {
                        handle.abort();
                    }
                    continue;
                }
            }
        } else {
            waiter.await
        };
        let (result, idx, _) = completed;
        let label = labels.remove(idx);
        join_handles.remove(idx);

        match result {
            Ok(Ok(msg)) => {
                debug!("[shard {shard_id}] {label} stage finished: {msg}");
                if label == "parse" && failure.is_none() {
                    info!("[shard {shard_id}] Input finished, draining remaining stages");
                    watch_tx.send_replace(PipelineState::Draining);
                }
            }
            Ok(Err(err)) => {
                error!("[shard {shard_id}] {label} stage failed: {err}");
                if failure.is_none() {
                    failure =
                        Some(err.context(format!("{label} stage of shard {shard_id} failed")));
                    watch_tx.send_replace(PipelineState::Failed);
                    cancel_shard(&handles).await;
                }
            }
            Err(join_err) => {
                if join_err.is_cancelled() {
                    debug!("[shard {shard_id}] {label} stage aborted");
                } else {
                    error!("[shard {shard_id}] {label} stage panicked: {join_err}");
                }
                if failure.is_none() {
                    failure = Some(anyhow::anyhow!(
                        "{label} stage of shard {shard_id} did not terminate cleanly: {join_err}"
                    ));
                    watch_tx.send_replace(PipelineState::Failed);
                    cancel_shard(&handles).await;
                }
            }
        }
    }

    match failure {
        None => {
            watch_tx.send_replace(PipelineState::Completed);
            info!("[shard {shard_id}] Pipeline completed");
            Ok(format!("shard {shard_id} completed"))
        }
        Some(err) => Err(err),
    }
}

struct PipelineSupervisorActor {
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    shards: Vec<ShardHandles>,
    runners: Vec<(usize, JoinHandle<anyhow::Result<String>>)>,
    stats: SupervisorStats,
}

impl PipelineSupervisorActor {
    async fn run(mut self) -> anyhow::Result<String> {
        let mut failure: Option<anyhow::Error> = None;
        loop {
            if self.runners.is_empty() {
                return match failure {
                    None => Ok("all shard pipelines completed".to_string()),
                    Some(err) => Err(err),
                };
            }
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SupervisorCommand::Shutdown(reply)) => {
                            info!("[Supervisor] Received shutdown command, draining all shards");
                            for shard in &self.shards {
                                let _ = shard.parse.shutdown().await;
                            }
                            self.drain_runners(&mut failure).await;
                            let _ = reply.send(());
                            return match failure {
                                None => Ok("pipeline shut down".to_string()),
                                Some(err) => Err(err),
                            };
                        }
                        None => {
                            debug!("[Supervisor] Command channel closed, waiting for shards");
                            self.drain_runners(&mut failure).await;
                            return match failure {
                                None => Ok("all shard pipelines completed".to_string()),
                                Some(err) => Err(err),
                            };
                        }
                    }
                }
                (result, idx, _) = futures::future::select_all(self.runners.iter_mut().map(|(_, join)| join)) => {
                    let (shard_id, _) = self.runners.remove(idx);
                    self.observe_shard(shard_id, result, &mut failure);
                }
            }
        }
    }

    async fn drain_runners(&mut self, failure: &mut Option<anyhow::Error>) {
        for (shard_id, runner) in std::mem::take(&mut self.runners) {
            let result = runner.await;
            self.observe_shard(shard_id, result, failure);
        }
    }

    fn observe_shard(
        &self,
        shard_id: usize,
        result: Result<anyhow::Result<String>, tokio::task::JoinError>,
        failure: &mut Option<anyhow::Error>,
    ) {
        match result {
            Ok(Ok(msg)) => {
                info!("[Supervisor] Shard {shard_id} finished: {msg}");
                self.stats.shards_completed.add(1, &[]);
            }
            Ok(Err(err)) => {
                error!("[Supervisor] Shard {shard_id} failed: {err:#}");
                self.stats.shards_failed.add(1, &[]);
                if failure.is_none() {
                    *failure = Some(err);
                }
            }
            Err(join_err) => {
                error!("[Supervisor] Shard {shard_id} runner panicked: {join_err}");
                self.stats.shards_failed.add(1, &[]);
                if failure.is_none() {
                    *failure = Some(anyhow::anyhow!(join_err));
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum PipelineSupervisorHandleError {
    SendError,
    ReceiveError,
}

impl std::fmt::Display for PipelineSupervisorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to pipeline supervisor"),
            Self::ReceiveError => write!(f, "error receiving response from pipeline supervisor"),
        }
    }
}

impl std::error::Error for PipelineSupervisorHandleError {}

/// Handle to interact with the running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSupervisorHandle {
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    states: Vec<watch::Receiver<PipelineState>>,
}

impl PipelineSupervisorHandle {
    /// Validate the configuration and start one stage chain per input
    /// shard. `sources.len()` must match `config.shards`.
    pub fn new<S, D, K, C>(
        config: PipelineConfig,
        sources: Vec<S>,
        writer: Arc<D>,
        sink: Arc<K>,
        coverage: Arc<C>,
        stores: Arc<StatsRegistry>,
        stats: either::Either<Meter, SupervisorStats>,
    ) -> Result<(JoinHandle<anyhow::Result<String>>, Self), ConfigurationError>
    where
        S: RecordSource,
        D: DestinationWriter,
        K: CheckpointSink,
        C: CoverageProvider,
    {
        config.validate()?;
        if sources.len() != config.shards {
            return Err(ConfigurationError::ShardSourceMismatch {
                shards: config.shards,
                sources: sources.len(),
            });
        }
        let (meter, stats) = match stats {
            either::Either::Left(meter) => {
                let stats = SupervisorStats::new(meter.clone());
                (meter, stats)
            }
            either::Either::Right(stats) => {
                (opentelemetry::global::meter("sluice.pipeline"), stats)
            }
        };

        let mut shards = Vec::new();
        let mut runners = Vec::new();
        let mut states = Vec::new();
        for (shard_id, source) in sources.into_iter().enumerate() {
            let (watch_tx, watch_rx) = watch::channel(PipelineState::Init);
            let (handles, joins) = spawn_shard(
                shard_id,
                &config,
                source,
                writer.clone(),
                sink.clone(),
                coverage.clone(),
                &stores,
                meter.clone(),
            );
            shards.push(handles.clone());
            runners.push((
                shard_id,
                tokio::spawn(run_shard(shard_id, handles, joins, watch_tx)),
            ));
            states.push(watch_rx);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let supervisor = PipelineSupervisorActor {
            cmd_rx,
            shards,
            runners,
            stats,
        };
        let join_handle = tokio::spawn(supervisor.run());
        Ok((join_handle, Self { cmd_tx, states }))
    }

    /// Gracefully drain and stop every shard: input pulling stops,
    /// buffered aggregates are flushed, releasable checkpoints are emitted.
    pub async fn shutdown(&self) -> Result<(), PipelineSupervisorHandleError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SupervisorCommand::Shutdown(tx))
            .await
            .map_err(|_| PipelineSupervisorHandleError::SendError)?;
        rx.await
            .map_err(|_| PipelineSupervisorHandleError::ReceiveError)
    }

    /// Current lifecycle state of one shard.
    pub fn shard_state(&self, shard_id: usize) -> Option<PipelineState> {
        self.states.get(shard_id).map(|rx| *rx.borrow())
    }

    /// Watch a shard's lifecycle transitions.
    pub fn watch_shard(&self, shard_id: usize) -> Option<watch::Receiver<PipelineState>> {
        self.states.get(shard_id).cloned()
    }

    pub fn shard_count(&self) -> usize {
        self.states.len()
    }
}
