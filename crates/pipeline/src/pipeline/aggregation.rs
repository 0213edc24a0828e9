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

//! Aggregation-stage actor.
//!
//! Each worker owns its shard's [`AggregateStore`], so accumulation for a
//! stream is naturally serialized. Closed aggregates are handed to the
//! bounded closed-aggregate channel shared with the flush pool; when the
//! destination falls behind, that channel fills and the `send` here blocks,
//! which is the engine's primary backpressure point - data is never
//! dropped. A periodic sweep closes aggregates whose staleness deadline
//! passed so streams that stop receiving records still flush promptly.

use crate::{
    aggregate::{Aggregate, AggregateStore, SizeEstimator},
    message::ChangeRecord,
};
use opentelemetry::metrics::{Counter, Meter};
use std::time::{Duration, Instant};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AggregationStats {
    pub received_records: Counter<u64>,
    pub estimation_errors: Counter<u64>,
    pub closed_aggregates: Counter<u64>,
    pub dropped_aggregates: Counter<u64>,
}

impl AggregationStats {
    pub fn new(meter: Meter) -> Self {
        let received_records = meter
            .u64_counter("sluice.pipeline.aggregation.received.records")
            .with_description("Number of records accepted for aggregation")
            .build();
        let estimation_errors = meter
            .u64_counter("sluice.pipeline.aggregation.estimation.errors")
            .with_description("Number of records skipped because size estimation failed")
            .build();
        let closed_aggregates = meter
            .u64_counter("sluice.pipeline.aggregation.closed.aggregates")
            .with_description("Number of aggregates closed and handed to the flush stage")
            .build();
        let dropped_aggregates = meter
            .u64_counter("sluice.pipeline.aggregation.dropped.aggregates")
            .with_description("Number of closed aggregates dropped during forced shutdown")
            .build();
        Self {
            received_records,
            estimation_errors,
            closed_aggregates,
            dropped_aggregates,
        }
    }
}

#[derive(Debug)]
pub enum AggregationCommand {
    /// Close and forward every open aggregate, replying with how many were
    /// closed. Used when a pipeline instance is being torn down.
    FlushAll(oneshot::Sender<usize>),
    Shutdown,
}

struct AggregationActor<E> {
    cmd_rx: mpsc::Receiver<AggregationCommand>,
    rx: async_channel::Receiver<ChangeRecord>,
    tx: async_channel::Sender<Aggregate>,
    store: AggregateStore<E>,
    sweep_interval: Duration,
    stats: AggregationStats,
    shard_id: usize,
    worker_id: usize,
}

impl<E: SizeEstimator> AggregationActor<E> {
    async fn run(mut self) -> anyhow::Result<String> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(AggregationCommand::FlushAll(reply)) => {
                            let closed = self.store.force_flush_all();
                            let count = closed.len();
                            for aggregate in closed {
                                self.forward_with_timeout(aggregate).await;
                            }
                            let _ = reply.send(count);
                        }
                        Some(AggregationCommand::Shutdown) => {
                            info!("Received shutdown command, shutting down AggregationActor");
                            for aggregate in self.store.force_flush_all() {
                                self.forward_with_timeout(aggregate).await;
                            }
                            return Ok("Aggregation terminated successfully".to_string());
                        }
                        None => {
                            info!("Command channel closed, shutting down AggregationActor");
                            return Ok("Aggregation terminated successfully".to_string());
                        }
                    }
                }
                _ = sweep.tick() => {
                    for aggregate in self.store.sweep_stale(Instant::now()) {
                        debug!(
                            "Staleness deadline passed for stream {}, closing aggregate {}",
                            aggregate.stream(), aggregate.index()
                        );
                        self.forward(aggregate).await?;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Ok(record) => {
                            self.stats.received_records.add(1, &self.tags());
                            match self.store.accumulate(record) {
                                Ok(closed) => {
                                    for aggregate in closed {
                                        self.forward(aggregate).await?;
                                    }
                                }
                                Err(err) => {
                                    // Scoped to the one record; the open
                                    // aggregate is untouched.
                                    warn!("Skipping record: {err}");
                                    self.stats.estimation_errors.add(1, &self.tags());
                                }
                            }
                        }
                        Err(_) => {
                            info!(
                                "Record channel closed, flushing remaining aggregates of shard {} worker {}",
                                self.shard_id, self.worker_id
                            );
                            for aggregate in self.store.force_flush_all() {
                                self.forward(aggregate).await?;
                            }
                            return Ok("Aggregation drained".to_string());
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

    /// Hand a closed aggregate to the flush stage. Blocks while the
    /// closed-aggregate buffer is full; this is the backpressure contract,
    /// the producer never drops.
    async fn forward(&self, aggregate: Aggregate) -> anyhow::Result<()> {
        let reason = aggregate
            .close_reason()
            .map(|reason| reason.to_string())
            .unwrap_or_default();
        self.stats.closed_aggregates.add(
            1,
            &[
                opentelemetry::KeyValue::new(
                    "shard_id",
                    opentelemetry::Value::I64(self.shard_id as i64),
                ),
                opentelemetry::KeyValue::new("close_reason", reason),
            ],
        );
        self.tx
            .send(aggregate)
            .await
            .map_err(|_| anyhow::anyhow!("closed-aggregate channel closed"))
    }

    /// Best-effort forward used on teardown, where the flush pool may
    /// already be gone and blocking forever would wedge the shutdown.
    async fn forward_with_timeout(&self, aggregate: Aggregate) {
        let stream = aggregate.stream().clone();
        let send = self.forward(aggregate);
        match tokio::time::timeout(Duration::from_secs(1), send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("Dropping closed aggregate for stream {stream} on teardown: {err}");
                self.stats.dropped_aggregates.add(1, &self.tags());
            }
            Err(_) => {
                warn!("Timed out handing aggregate for stream {stream} to a drained flush stage");
                self.stats.dropped_aggregates.add(1, &self.tags());
            }
        }
    }
}

#[derive(Debug)]
pub enum AggregationActorHandleError {
    SendError,
    ReceiveError,
}

impl std::fmt::Display for AggregationActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "error sending command to aggregation actor"),
            Self::ReceiveError => write!(f, "error receiving reply from aggregation actor"),
        }
    }
}

impl std::error::Error for AggregationActorHandleError {}

#[derive(Debug, Clone)]
pub struct AggregationActorHandle {
    cmd_tx: mpsc::Sender<AggregationCommand>,
}

impl AggregationActorHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new<E: SizeEstimator + Sync>(
        store: AggregateStore<E>,
        sweep_interval: Duration,
        record_rx: async_channel::Receiver<ChangeRecord>,
        closed_tx: async_channel::Sender<Aggregate>,
        stats: either::Either<Meter, AggregationStats>,
        shard_id: usize,
        worker_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let stats = match stats {
            either::Either::Left(meter) => AggregationStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = AggregationActor {
            cmd_rx,
            rx: record_rx,
            tx: closed_tx,
            store,
            sweep_interval,
            stats,
            shard_id,
            worker_id,
        };
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_tx })
    }

    /// Force-close every open aggregate and hand them to the flush stage.
    pub async fn flush_all(&self) -> Result<usize, AggregationActorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(AggregationCommand::FlushAll(reply_tx))
            .await
            .map_err(|_| AggregationActorHandleError::SendError)?;
        reply_rx
            .await
            .map_err(|_| AggregationActorHandleError::ReceiveError)
    }

    pub async fn shutdown(&self) -> Result<(), AggregationActorHandleError> {
        self.cmd_tx
            .send(AggregationCommand::Shutdown)
            .await
            .map_err(|_| AggregationActorHandleError::SendError)
    }
}
