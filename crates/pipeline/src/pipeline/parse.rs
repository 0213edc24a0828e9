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

//! Parse-stage actor: pulls the input collaborator and dispatches over the
//! message subtypes with one exhaustive match. Records are routed to the
//! shard's aggregation workers by stream key; checkpoints are registered
//! with the state stage together with the covering set captured at this
//! instant.

use crate::{
    collaborators::{CoverageProvider, RecordSource},
    message::SourceItem,
    pipeline::state_tracker::StateEvent,
};
use opentelemetry::metrics::{Counter, Meter};
use rustc_hash::FxHasher;
use sluice_stats::{store::EmissionStatsStore, PartitionHistogram, StreamKey};
use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ParseStats {
    pub received_records: Counter<u64>,
    pub received_checkpoints: Counter<u64>,
}

impl ParseStats {
    pub fn new(meter: Meter) -> Self {
        let received_records = meter
            .u64_counter("sluice.pipeline.parse.received.records")
            .with_description("Number of change records pulled from the input")
            .build();
        let received_checkpoints = meter
            .u64_counter("sluice.pipeline.parse.received.checkpoints")
            .with_description("Number of checkpoints pulled from the input")
            .build();
        Self {
            received_records,
            received_checkpoints,
        }
    }
}

#[derive(Debug, Clone, Copy, strum_macros::Display)]
pub enum ParseCommand {
    Shutdown,
}

struct ParseActor<S, C> {
    cmd_rx: mpsc::Receiver<ParseCommand>,
    source: S,
    coverage: Arc<C>,
    emitted: Arc<EmissionStatsStore>,
    record_txs: Vec<async_channel::Sender<crate::message::ChangeRecord>>,
    state_tx: async_channel::Sender<StateEvent>,
    stats: ParseStats,
    shard_id: usize,
}

fn route(stream: &StreamKey, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    stream.hash(&mut hasher);
    hasher.finish() as usize % workers
}

impl<S: RecordSource, C: CoverageProvider> ParseActor<S, C> {
    async fn run(mut self) -> anyhow::Result<String> {
        let tags = [opentelemetry::KeyValue::new(
            "shard_id",
            opentelemetry::Value::I64(self.shard_id as i64),
        )];
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ParseCommand::Shutdown) => {
                            info!("Received shutdown command, shutting down ParseActor");
                        }
                        None => {
                            info!("Command channel closed, shutting down ParseActor");
                        }
                    }
                    return Ok("Parse stage terminated successfully".to_string());
                }
                item = self.source.next() => {
                    match item {
                        Ok(SourceItem::Record(record)) => {
                            self.stats.received_records.add(1, &tags);
                            // Book the record against its lane before it is
                            // forwarded, so a checkpoint observed next sees it.
                            let mut counts = PartitionHistogram::new();
                            counts.record(record.partition().clone(), 1);
                            self.emitted.accept_stats(
                                record.stream(),
                                counts,
                                PartitionHistogram::new(),
                            );
                            let worker = route(record.stream(), self.record_txs.len());
                            if self.record_txs[worker].send(record).await.is_err() {
                                return Err(anyhow::anyhow!(
                                    "aggregation channel closed while parsing"
                                ));
                            }
                        }
                        Ok(SourceItem::Checkpoint(checkpoint)) => {
                            self.stats.received_checkpoints.add(1, &tags);
                            let coverage = self.coverage.coverage(&checkpoint);
                            let event = StateEvent::Register { checkpoint, coverage };
                            if self.state_tx.send(event).await.is_err() {
                                return Err(anyhow::anyhow!(
                                    "state channel closed while parsing"
                                ));
                            }
                        }
                        Ok(SourceItem::EndOfStream) => {
                            info!("Input reached end of stream, draining shard {}", self.shard_id);
                            return Ok("Input drained".to_string());
                        }
                        Err(err) => {
                            error!("Input source failed: {err}");
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseActorHandle {
    cmd_tx: mpsc::Sender<ParseCommand>,
}

impl ParseActorHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new<S: RecordSource, C: CoverageProvider>(
        source: S,
        coverage: Arc<C>,
        emitted: Arc<EmissionStatsStore>,
        record_txs: Vec<async_channel::Sender<crate::message::ChangeRecord>>,
        state_tx: async_channel::Sender<StateEvent>,
        stats: either::Either<Meter, ParseStats>,
        shard_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_tx, cmd_rx) = mpsc::channel(10);
        let stats = match stats {
            either::Either::Left(meter) => ParseStats::new(meter),
            either::Either::Right(stats) => stats,
        };
        let actor = ParseActor {
            cmd_rx,
            source,
            coverage,
            emitted,
            record_txs,
            state_tx,
            stats,
            shard_id,
        };
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_tx })
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<ParseCommand>> {
        self.cmd_tx.send(ParseCommand::Shutdown).await
    }
}
