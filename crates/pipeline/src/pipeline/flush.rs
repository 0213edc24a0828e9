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

//! Flush-stage worker pool.
//!
//! Workers share one closed-aggregate receiver and block on destination
//! I/O. A successful write reports the flushed partition counts and bytes
//! to the committed ledger and the metric stores, then notifies the state
//! stage so pending checkpoints are re-evaluated. Transient write errors
//! keep the aggregate pending and retry; fatal ones fail the pipeline
//! instance.

use crate::{
    aggregate::Aggregate,
    collaborators::{DestinationWriter, FlushError},
    pipeline::state_tracker::{FlushNotice, StateEvent},
    stores::{METRIC_BYTES_FLUSHED, METRIC_RECORDS_FLUSHED},
};
use opentelemetry::metrics::{Counter, Meter};
use sluice_stats::{
    store::{AdditionalMetricsStore, EmissionStatsStore, MetricStatsStore},
    EmissionStats,
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct FlushStats {
    pub received_aggregates: Counter<u64>,
    pub flushed_aggregates: Counter<u64>,
    pub transient_retries: Counter<u64>,
    pub fatal_errors: Counter<u64>,
}

impl FlushStats {
    pub fn new(meter: Meter) -> Self {
        let received_aggregates = meter
            .u64_counter("sluice.pipeline.flush.received.aggregates")
            .with_description("Number of closed aggregates picked up for flushing")
            .build();
        let flushed_aggregates = meter
            .u64_counter("sluice.pipeline.flush.flushed.aggregates")
            .with_description("Number of aggregates successfully written to the destination")
            .build();
        let transient_retries = meter
            .u64_counter("sluice.pipeline.flush.transient.retries")
            .with_description("Number of transient destination failures that were retried")
            .build();
        let fatal_errors = meter
            .u64_counter("sluice.pipeline.flush.fatal.errors")
            .with_description("Number of fatal destination failures")
            .build();
        Self {
            received_aggregates,
            flushed_aggregates,
            transient_retries,
            fatal_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, strum_macros::Display)]
pub enum FlushWorkerCommand {
    Shutdown,
}

struct FlushActor<D> {
    cmd_rx: mpsc::Receiver<FlushWorkerCommand>,
    rx: async_channel::Receiver<Aggregate>,
    writer: Arc<D>,
    committed: Arc<EmissionStatsStore>,
    metrics: Arc<MetricStatsStore>,
    additional: Arc<AdditionalMetricsStore>,
    state_tx: async_channel::Sender<StateEvent>,
    retry_backoff: Duration,
    stats: FlushStats,
    shard_id: usize,
    worker_id: usize,
}

impl<D: DestinationWriter> FlushActor<D> {
    async fn run(mut self) -> anyhow::Result<String> {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(FlushWorkerCommand::Shutdown) => {
                            info!("Received shutdown command, shutting down FlushActor");
                        }
                        None => {
                            info!("Command channel closed, shutting down FlushActor");
                        }
                    }
                    return Ok("Flush worker terminated successfully".to_string());
                }
                msg = self.rx.recv() => {
                    match msg {
                        Ok(aggregate) => {
                            self.stats.received_aggregates.add(1, &self.tags());
                            if !self.flush(aggregate).await? {
                                return Ok("Flush worker shut down during retry".to_string());
                            }
                        }
                        Err(_) => {
                            return Ok("Flush worker drained".to_string());
                        }
                    }
                }
            }
        }
    }

    fn tags(&self) -> [opentelemetry::KeyValue; 2] {
        [
            opentelemetry::KeyValue::new("shard_id", opentelemetry::Value::I64(self.shard_id as i64)),
            opentelemetry::KeyValue::new(
                "worker_id",
                opentelemetry::Value::I64(self.worker_id as i64),
            ),
        ]
    }

    /// Write one aggregate, retrying transient failures. Returns `false`
    /// when a shutdown arrived mid-retry and the worker should stop; the
    /// pending aggregate is abandoned and at-least-once delivery is left to
    /// the next sync.
    async fn flush(&mut self, mut aggregate: Aggregate) -> anyhow::Result<bool> {
        let result = loop {
            match self.writer.write(&aggregate).await {
                Ok(result) => break result,
                Err(FlushError::Transient(msg)) => {
                    warn!(
                        "Transient flush failure for stream {} aggregate {}, retrying: {msg}",
                        aggregate.stream(),
                        aggregate.index()
                    );
                    self.stats.transient_retries.add(1, &self.tags());
                    tokio::time::sleep(self.retry_backoff).await;
                    match self.cmd_rx.try_recv() {
                        Ok(FlushWorkerCommand::Shutdown)
                        | Err(mpsc::error::TryRecvError::Disconnected) => {
                            warn!(
                                "Abandoning pending aggregate {} for stream {} on shutdown",
                                aggregate.index(),
                                aggregate.stream()
                            );
                            return Ok(false);
                        }
                        Err(mpsc::error::TryRecvError::Empty) => {}
                    }
                }
                Err(err @ FlushError::Fatal(_)) => {
                    error!(
                        "Fatal flush failure for stream {} aggregate {}: {err}",
                        aggregate.stream(),
                        aggregate.index()
                    );
                    self.stats.fatal_errors.add(1, &self.tags());
                    return Err(err.into());
                }
            }
        };
        aggregate.mark_persisted();

        let stream = aggregate.stream().clone();
        let flushed = EmissionStats::new(
            result.partition_counts.total(),
            result.partition_bytes.total(),
        );
        for (partition, count) in result.partition_counts.iter() {
            self.additional
                .add(&stream, METRIC_RECORDS_FLUSHED, partition.clone(), count as f64);
            self.metrics
                .add(&stream, "aggregates.flushed", partition.clone(), 1);
        }
        for (partition, bytes) in result.partition_bytes.iter() {
            self.additional
                .add(&stream, METRIC_BYTES_FLUSHED, partition.clone(), bytes as f64);
        }
        // The committed ledger must see the partitions before the state
        // stage re-evaluates pending checkpoints.
        self.committed
            .accept_stats(&stream, result.partition_counts, result.partition_bytes);
        self.stats.flushed_aggregates.add(1, &self.tags());

        let notice = FlushNotice {
            stream,
            aggregate_index: aggregate.index(),
            stats: flushed,
        };
        self.state_tx
            .send(StateEvent::Flushed(notice))
            .await
            .map_err(|_| anyhow::anyhow!("state channel closed while reporting a flush"))?;
        Ok(true)
    }
}

#[derive(Debug)]
pub enum FlushActorHandleError {
    SendError,
}

impl std::fmt::Display for FlushActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to flush worker"),
        }
    }
}

impl std::error::Error for FlushActorHandleError {}

#[derive(Debug, Clone)]
pub struct FlushActorHandle {
    cmd_tx: mpsc::Sender<FlushWorkerCommand>,
}

impl FlushActorHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new<D: DestinationWriter>(
        writer: Arc<D>,
        committed: Arc<EmissionStatsStore>,
        metrics: Arc<MetricStatsStore>,
        additional: Arc<AdditionalMetricsStore>,
        closed_rx: async_channel::Receiver<Aggregate>,
        state_tx: async_channel::Sender<StateEvent>,
        retry_backoff: Duration,
        stats: either::Either<Meter, FlushStats>,
        shard_id: usize,
        worker_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let stats = match stats {
            either::Either::Left(meter) => FlushStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = FlushActor {
            cmd_rx,
            rx: closed_rx,
            writer,
            committed,
            metrics,
            additional,
            state_tx,
            retry_backoff,
            stats,
            shard_id,
            worker_id,
        };
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_tx })
    }

    pub async fn shutdown(&self) -> Result<(), FlushActorHandleError> {
        self.cmd_tx
            .send(FlushWorkerCommand::Shutdown)
            .await
            .map_err(|_| FlushActorHandleError::SendError)
    }
}
