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

use crate::{
    aggregate::{AggregateStore, JsonSizeEstimator, TriggerPolicy},
    collaborators::{
        CheckpointSink, DestinationWriter, FlushError, FlushResult, RecordSource, SinkError,
        SourceError,
    },
    config::{PipelineConfig, TriggerConfig},
    message::{ChangeRecord, Checkpoint, CheckpointTarget, EnrichedCheckpoint, SourceItem},
    pipeline::{AggregationActorHandle, PipelineState, PipelineSupervisorHandle},
    start_pipeline,
    stores::{EmittedCoverageProvider, StatsRegistry},
};
use sluice_stats::{EmissionStats, PartitionKey, StreamKey};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::Semaphore;

fn meter() -> opentelemetry::metrics::Meter {
    opentelemetry::global::meter("sluice.pipeline.test")
}

fn trigger() -> TriggerConfig {
    TriggerConfig {
        max_records_per_aggregate: 100,
        max_bytes_per_aggregate: 1 << 20,
        staleness_deadline: Duration::from_secs(60),
        max_bytes_all_aggregates: 1 << 24,
        max_buffered_aggregates: 8,
    }
}

fn config(trigger: TriggerConfig) -> PipelineConfig {
    PipelineConfig {
        shards: 1,
        buffer_size: 64,
        aggregate_workers: 1,
        flush_workers: 2,
        sweep_interval: Duration::from_millis(20),
        flush_retry_backoff: Duration::from_millis(10),
        additional_metrics: Vec::new(),
        trigger,
    }
}

fn record(stream: &str, lane: &str) -> SourceItem {
    SourceItem::Record(ChangeRecord::new(
        StreamKey::from(stream),
        PartitionKey::from(lane),
        serde_json::json!({ "id": 42, "name": "row", "active": true }),
    ))
}

fn stream_checkpoint(id: u64, stream: &str) -> SourceItem {
    SourceItem::Checkpoint(Checkpoint::new(
        id,
        CheckpointTarget::Stream(StreamKey::from(stream)),
        serde_json::json!({ "cursor": id }),
    ))
}

fn global_checkpoint(id: u64) -> SourceItem {
    SourceItem::Checkpoint(Checkpoint::new(
        id,
        CheckpointTarget::Global,
        serde_json::json!({ "cursor": id }),
    ))
}

/// Replays a fixed item list; either ends the stream afterwards or keeps
/// the source open forever (for staleness and shutdown tests).
struct ScriptedSource {
    items: VecDeque<SourceItem>,
    hold_open: bool,
}

impl ScriptedSource {
    fn new(items: Vec<SourceItem>) -> Self {
        Self {
            items: items.into(),
            hold_open: false,
        }
    }

    fn holding(items: Vec<SourceItem>) -> Self {
        Self {
            items: items.into(),
            hold_open: true,
        }
    }
}

impl RecordSource for ScriptedSource {
    async fn next(&mut self) -> Result<SourceItem, SourceError> {
        match self.items.pop_front() {
            Some(item) => Ok(item),
            None if self.hold_open => std::future::pending().await,
            None => Ok(SourceItem::EndOfStream),
        }
    }
}

/// Records successful writes; can fail configured streams fatally, fail
/// the first N writes transiently, or park writes touching one partition
/// behind a semaphore.
#[derive(Default)]
struct RecordingDestination {
    writes: Mutex<Vec<(StreamKey, u64, u64)>>,
    fatal_streams: Vec<StreamKey>,
    transient_left: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    gated_partition: Option<PartitionKey>,
}

impl RecordingDestination {
    fn written_records(&self) -> u64 {
        self.writes
            .lock()
            .expect("writes lock")
            .iter()
            .map(|(_, _, count)| count)
            .sum()
    }

    fn written_indexes(&self) -> Vec<u64> {
        self.writes
            .lock()
            .expect("writes lock")
            .iter()
            .map(|(_, index, _)| *index)
            .collect()
    }
}

impl DestinationWriter for RecordingDestination {
    async fn write(&self, aggregate: &crate::aggregate::Aggregate) -> Result<FlushResult, FlushError> {
        if let (Some(gate), Some(partition)) = (&self.gate, &self.gated_partition) {
            if aggregate.partition_counts().get(partition) > 0 {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| FlushError::Fatal("gate closed".to_string()))?;
                permit.forget();
            }
        }
        if self.fatal_streams.contains(aggregate.stream()) {
            return Err(FlushError::Fatal("destination rejected stream".to_string()));
        }
        if self
            .transient_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(FlushError::Transient("destination busy".to_string()));
        }
        assert!(!aggregate.is_persisted());
        self.writes.lock().expect("writes lock").push((
            aggregate.stream().clone(),
            aggregate.index(),
            aggregate.record_count(),
        ));
        Ok(FlushResult {
            partition_counts: aggregate.partition_counts().clone(),
            partition_bytes: aggregate.partition_bytes().clone(),
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    emitted: Mutex<Vec<EnrichedCheckpoint>>,
}

impl RecordingSink {
    fn ids(&self) -> Vec<u64> {
        self.emitted
            .lock()
            .expect("emitted lock")
            .iter()
            .map(|cp| cp.checkpoint().id())
            .collect()
    }

    fn stats_of(&self, id: u64) -> Option<EmissionStats> {
        self.emitted
            .lock()
            .expect("emitted lock")
            .iter()
            .find(|cp| cp.checkpoint().id() == id)
            .map(|cp| cp.stats())
    }

    fn len(&self) -> usize {
        self.emitted.lock().expect("emitted lock").len()
    }
}

impl CheckpointSink for RecordingSink {
    async fn emit(&self, checkpoint: EnrichedCheckpoint) -> Result<(), SinkError> {
        self.emitted.lock().expect("emitted lock").push(checkpoint);
        Ok(())
    }
}

async fn wait_for_state(handle: &PipelineSupervisorHandle, shard: usize, state: PipelineState) {
    let mut rx = handle.watch_shard(shard).expect("unknown shard");
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("shard {shard} never reached {state}"))
        .expect("state watch closed");
}

async fn wait_for_emissions(sink: &RecordingSink, count: usize) {
    for _ in 0..250 {
        if sink.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("sink never saw {count} checkpoints");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_pipeline_flushes_and_releases_in_order() {
    let source = ScriptedSource::new(vec![
        record("users", "w1"),
        record("users", "w1"),
        record("users", "w1"),
        stream_checkpoint(1, "users"),
        record("users", "w2"),
        record("users", "w2"),
        stream_checkpoint(2, "users"),
    ]);
    let destination = Arc::new(RecordingDestination::default());
    let sink = Arc::new(RecordingSink::default());

    let (join, handle, _stores) = start_pipeline(
        config(trigger()),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(handle.shard_state(0), Some(PipelineState::Completed));

    assert_eq!(destination.written_records(), 5);
    assert_eq!(sink.ids(), vec![1, 2]);

    let first = sink.stats_of(1).expect("checkpoint 1 missing");
    assert_eq!(first.count, 3);
    assert!(first.bytes > 0);
    let second = sink.stats_of(2).expect("checkpoint 2 missing");
    assert_eq!(second.count, 2);

    let emitted = sink.emitted.lock().expect("emitted lock");
    let metrics = emitted[0].metrics();
    assert_eq!(metrics.get("records.flushed"), Some(&3.0));
    assert!(metrics.get("bytes.flushed").copied().unwrap_or(0.0) > 0.0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_later_checkpoint_waits_for_earlier_one() {
    // One record per aggregate, and every write touching laneA is parked
    // behind a semaphore with no permits: the second checkpoint's
    // partitions finish flushing first.
    let source = ScriptedSource::new(vec![
        record("users", "laneA"),
        stream_checkpoint(1, "users"),
        record("users", "laneB"),
        stream_checkpoint(2, "users"),
    ]);
    let gate = Arc::new(Semaphore::new(0));
    let destination = Arc::new(RecordingDestination {
        gate: Some(gate.clone()),
        gated_partition: Some(PartitionKey::from("laneA")),
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());

    let (join, _handle, _stores) = start_pipeline(
        config(TriggerConfig {
            max_records_per_aggregate: 1,
            ..trigger()
        }),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    // laneB has committed, but checkpoint 2 must stay behind checkpoint 1.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.len(), 0);

    gate.add_permits(1);
    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(sink.ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_backpressure_blocks_when_buffer_is_full() {
    // Aggregation stage in isolation: every record closes an aggregate,
    // the closed-aggregate buffer holds two, and nothing consumes it.
    let trigger = TriggerConfig {
        max_records_per_aggregate: 1,
        max_buffered_aggregates: 2,
        ..trigger()
    };
    let (record_tx, record_rx) = async_channel::bounded(16);
    let (closed_tx, closed_rx) =
        async_channel::bounded(trigger.max_buffered_aggregates);
    let store = AggregateStore::new(TriggerPolicy::from_config(&trigger), JsonSizeEstimator);
    let (join, handle) = AggregationActorHandle::new(
        store,
        Duration::from_secs(3600),
        record_rx,
        closed_tx,
        either::Either::Left(meter()),
        0,
        0,
    );

    for item in [
        record("users", "w1"),
        record("orders", "w1"),
        record("events", "w1"),
    ] {
        let SourceItem::Record(change) = item else {
            unreachable!()
        };
        record_tx.send(change).await.expect("record send failed");
    }

    // The third closure blocks instead of erroring or dropping.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closed_rx.len(), 2);

    // Freeing one slot unblocks exactly one handoff.
    let first = closed_rx.recv().await.expect("recv failed");
    assert_eq!(first.index(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(closed_rx.len(), 2);

    drop(record_tx);
    let second = closed_rx.recv().await.expect("recv failed");
    let third = closed_rx.recv().await.expect("recv failed");
    assert_eq!((second.index(), third.index()), (1, 2));

    join.await
        .expect("aggregation panicked")
        .expect("aggregation failed");
    drop(handle);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_fatal_flush_error_fails_the_shard() {
    let source = ScriptedSource::new(vec![record("users", "w1"), stream_checkpoint(1, "users")]);
    let destination = Arc::new(RecordingDestination {
        fatal_streams: vec![StreamKey::from("users")],
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());

    let (join, handle, _stores) = start_pipeline(
        config(TriggerConfig {
            max_records_per_aggregate: 1,
            ..trigger()
        }),
        vec![source],
        destination,
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    let result = join.await.expect("supervisor panicked");
    assert!(result.is_err());
    wait_for_state(&handle, 0, PipelineState::Failed).await;
    // The checkpoint's partitions never committed, so it never released.
    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn test_transient_flush_errors_are_retried() {
    let source = ScriptedSource::new(vec![record("users", "w1"), stream_checkpoint(1, "users")]);
    let destination = Arc::new(RecordingDestination {
        transient_left: AtomicUsize::new(2),
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());

    let (join, _handle, _stores) = start_pipeline(
        config(TriggerConfig {
            max_records_per_aggregate: 1,
            ..trigger()
        }),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(destination.written_records(), 1);
    assert_eq!(sink.ids(), vec![1]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_staleness_sweep_flushes_idle_streams() {
    // The source never ends; only the staleness sweep can close the
    // aggregate and let the checkpoint release.
    let source = ScriptedSource::holding(vec![
        record("users", "w1"),
        stream_checkpoint(1, "users"),
    ]);
    let destination = Arc::new(RecordingDestination::default());
    let sink = Arc::new(RecordingSink::default());

    let (join, handle, _stores) = start_pipeline(
        config(TriggerConfig {
            staleness_deadline: Duration::from_millis(50),
            ..trigger()
        }),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    wait_for_emissions(&sink, 1).await;
    assert_eq!(sink.ids(), vec![1]);
    assert_eq!(destination.written_records(), 1);

    handle.shutdown().await.expect("shutdown failed");
    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(handle.shard_state(0), Some(PipelineState::Completed));
}

#[tokio::test]
async fn test_shutdown_drains_buffered_records() {
    // Nothing triggers a close on its own; the graceful shutdown must
    // flush the buffered aggregate and release the checkpoint.
    let source = ScriptedSource::holding(vec![
        record("users", "w1"),
        record("users", "w1"),
        stream_checkpoint(1, "users"),
    ]);
    let destination = Arc::new(RecordingDestination::default());
    let sink = Arc::new(RecordingSink::default());

    let (join, handle, _stores) = start_pipeline(
        config(trigger()),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.expect("shutdown failed");

    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(destination.written_records(), 2);
    assert_eq!(sink.ids(), vec![1]);
    assert_eq!(handle.shard_state(0), Some(PipelineState::Completed));
}

#[tokio::test]
async fn test_global_checkpoint_covers_all_streams() {
    let source = ScriptedSource::new(vec![
        record("users", "u-w1"),
        record("users", "u-w1"),
        record("orders", "o-w1"),
        global_checkpoint(1),
    ]);
    let destination = Arc::new(RecordingDestination::default());
    let sink = Arc::new(RecordingSink::default());

    let (join, _handle, stores) = start_pipeline(
        config(trigger()),
        vec![source],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    join.await.expect("supervisor panicked").expect("pipeline failed");
    assert_eq!(sink.ids(), vec![1]);
    let stats = sink.stats_of(1).expect("checkpoint missing");
    assert_eq!(stats.count, 3);

    // A global first checkpoint disables per-stream aggregation.
    assert_eq!(stores.per_stream.stream_total(&StreamKey::from("users")), None);
    assert_eq!(stores.per_stream.run_total().count, 3);
}

#[tokio::test]
async fn test_shards_fail_independently() {
    let shard0 = ScriptedSource::new(vec![record("users", "w1"), stream_checkpoint(1, "users")]);
    let shard1 = ScriptedSource::new(vec![record("orders", "w1"), stream_checkpoint(2, "orders")]);
    // Only the stream handled by shard 0 is rejected by the destination.
    let destination = Arc::new(RecordingDestination {
        fatal_streams: vec![StreamKey::from("users")],
        ..Default::default()
    });
    let sink = Arc::new(RecordingSink::default());

    let (join, handle, _stores) = start_pipeline(
        PipelineConfig {
            shards: 2,
            ..config(TriggerConfig {
                max_records_per_aggregate: 1,
                ..trigger()
            })
        },
        vec![shard0, shard1],
        destination.clone(),
        sink.clone(),
        meter(),
    )
    .expect("pipeline failed to start");

    let result = join.await.expect("supervisor panicked");
    assert!(result.is_err());

    wait_for_state(&handle, 0, PipelineState::Failed).await;
    wait_for_state(&handle, 1, PipelineState::Completed).await;
    // The healthy shard's checkpoint was still released.
    assert_eq!(sink.ids(), vec![2]);
    assert_eq!(destination.written_indexes().len(), 1);
}

#[tokio::test]
async fn test_shard_count_must_match_sources() {
    let destination = Arc::new(RecordingDestination::default());
    let sink = Arc::new(RecordingSink::default());
    let stores = Arc::new(StatsRegistry::new(Vec::new()));
    let coverage = Arc::new(EmittedCoverageProvider::new(stores.emitted.clone()));

    let result = PipelineSupervisorHandle::new(
        PipelineConfig {
            shards: 2,
            ..config(trigger())
        },
        vec![ScriptedSource::new(Vec::new())],
        destination,
        sink,
        coverage,
        stores,
        either::Either::Left(meter()),
    );
    assert!(result.is_err());
}
