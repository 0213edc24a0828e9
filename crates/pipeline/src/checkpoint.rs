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

//! Checkpoint matching and enrichment.
//!
//! The [`CheckpointRegistry`] holds pending checkpoints per stream in
//! registration order and releases one only when every `(stream,
//! partition) -> count` contribution it covers has matching committed
//! stats. Checkpoints for the same stream are always released in
//! registration order, no matter in which order their partitions finished
//! flushing. The [`CheckpointEnricher`] attaches the committed totals and
//! the complete additional-metrics snapshot immediately before release and
//! evicts the released partitions' live stats.

use crate::message::{Checkpoint, CheckpointCoverage, CheckpointTarget, EnrichedCheckpoint};
use chrono::Utc;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use sluice_stats::{
    store::{AdditionalMetricsStore, EmissionStatsStore, MetricStatsStore, PerStreamStatsStore},
    EmissionStats, StreamKey,
};
use std::{collections::VecDeque, sync::Arc};
use tracing::warn;

/// Stats-bookkeeping corruption detected while releasing a checkpoint.
/// Always fatal.
#[derive(Debug, Clone)]
pub struct CheckpointOrderingViolation {
    detail: String,
}

impl CheckpointOrderingViolation {
    pub(crate) fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for CheckpointOrderingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpoint ordering violation: {}", self.detail)
    }
}

impl std::error::Error for CheckpointOrderingViolation {}

#[derive(Debug)]
struct PendingCheckpoint {
    seq: u64,
    checkpoint: Checkpoint,
    coverage: CheckpointCoverage,
}

/// Pending checkpoints keyed by target, FIFO per stream.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    next_seq: u64,
    per_stream: FxHashMap<StreamKey, VecDeque<PendingCheckpoint>>,
    global: VecDeque<PendingCheckpoint>,
    last_released: FxHashMap<StreamKey, u64>,
    last_released_global: Option<u64>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint against the covering set active at this
    /// instant.
    pub fn register(&mut self, checkpoint: Checkpoint, coverage: CheckpointCoverage) {
        let pending = PendingCheckpoint {
            seq: self.next_seq,
            checkpoint,
            coverage,
        };
        self.next_seq += 1;
        match pending.checkpoint.target() {
            CheckpointTarget::Stream(stream) => {
                self.per_stream
                    .entry(stream.clone())
                    .or_default()
                    .push_back(pending);
            }
            CheckpointTarget::Global => self.global.push_back(pending),
        }
    }

    /// Pop every checkpoint whose full covering set now has committed
    /// entries, in registration order per stream. A later checkpoint whose
    /// partitions flushed first stays queued behind an earlier pending one.
    pub fn release_ready(
        &mut self,
        committed: &EmissionStatsStore,
    ) -> Result<Vec<(Checkpoint, CheckpointCoverage)>, CheckpointOrderingViolation> {
        let mut ready = Vec::new();
        for queue in self
            .per_stream
            .values_mut()
            .chain(std::iter::once(&mut self.global))
        {
            while let Some(head) = queue.front() {
                if !Self::is_covered(&head.coverage, committed) {
                    break;
                }
                let Some(pending) = queue.pop_front() else {
                    break;
                };
                let last = match pending.checkpoint.target() {
                    CheckpointTarget::Stream(stream) => {
                        self.last_released.insert(stream.clone(), pending.seq)
                    }
                    CheckpointTarget::Global => self.last_released_global.replace(pending.seq),
                };
                if let Some(last) = last {
                    if last >= pending.seq {
                        return Err(CheckpointOrderingViolation::new(format!(
                            "checkpoint {} (seq {}) released after seq {last}",
                            pending.checkpoint.id(),
                            pending.seq
                        )));
                    }
                }
                ready.push(pending);
            }
        }
        // Emission order follows registration order across targets too.
        ready.sort_by_key(|pending| pending.seq);
        Ok(ready
            .into_iter()
            .map(|pending| (pending.checkpoint, pending.coverage))
            .collect())
    }

    fn is_covered(coverage: &CheckpointCoverage, committed: &EmissionStatsStore) -> bool {
        coverage
            .iter()
            .all(|entry| committed.partition_count(&entry.stream, &entry.partition) >= entry.records)
    }

    pub fn pending_count(&self) -> usize {
        self.per_stream.values().map(VecDeque::len).sum::<usize>() + self.global.len()
    }

    /// Drop and return everything still pending, e.g. when a pipeline
    /// instance fails and its checkpoints can never release.
    pub fn drain_pending(&mut self) -> Vec<Checkpoint> {
        let mut dropped = Vec::new();
        for queue in self
            .per_stream
            .values_mut()
            .chain(std::iter::once(&mut self.global))
        {
            dropped.extend(queue.drain(..).map(|pending| pending.checkpoint));
        }
        dropped
    }
}

/// Attaches committed stats and the additional-metrics snapshot to a
/// checkpoint immediately before release.
pub struct CheckpointEnricher {
    committed: Arc<EmissionStatsStore>,
    per_stream: Arc<PerStreamStatsStore>,
    metrics: Arc<MetricStatsStore>,
    additional: Arc<AdditionalMetricsStore>,
}

impl CheckpointEnricher {
    pub fn new(
        committed: Arc<EmissionStatsStore>,
        per_stream: Arc<PerStreamStatsStore>,
        metrics: Arc<MetricStatsStore>,
        additional: Arc<AdditionalMetricsStore>,
    ) -> Self {
        Self {
            committed,
            per_stream,
            metrics,
            additional,
        }
    }

    /// Drain the covered partitions' committed stats and metrics into the
    /// checkpoint payload. Draining less than the covering set requires is
    /// bookkeeping corruption and is fatal.
    pub fn enrich(
        &self,
        checkpoint: Checkpoint,
        coverage: CheckpointCoverage,
    ) -> Result<EnrichedCheckpoint, CheckpointOrderingViolation> {
        let mut stats = EmissionStats::default();
        // Stable schema first: every declared key, defaulting to 0.0.
        let mut metrics: IndexMap<String, f64> = self
            .additional
            .declared_keys()
            .map(|key| (key.to_string(), 0.0))
            .collect();

        let required = coverage.records_by_stream();
        for (stream, partitions) in coverage.by_stream() {
            let drained = self.committed.commit(&stream, &partitions);
            let needed = required.get(&stream).copied().unwrap_or(0);
            if drained.count < needed {
                return Err(CheckpointOrderingViolation::new(format!(
                    "checkpoint {} covers {needed} records for stream {stream} but only {} were committed",
                    checkpoint.id(),
                    drained.count
                )));
            }
            self.per_stream.record_commit(&stream, drained);
            stats.merge(drained);

            for (key, value) in self.additional.drain(&stream, &partitions) {
                if let Some(slot) = metrics.get_mut(&key) {
                    *slot += value;
                } else {
                    metrics.insert(key, value);
                }
            }
            for (key, value) in self.metrics.drain(&stream, &partitions) {
                *metrics.entry(key).or_insert(0.0) += value as f64;
            }
        }

        if coverage.is_empty() {
            warn!(
                "Releasing checkpoint {} with an empty covering set",
                checkpoint.id()
            );
        }

        Ok(EnrichedCheckpoint::new(
            checkpoint,
            stats,
            metrics,
            Utc::now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CoverageEntry;
    use sluice_stats::{PartitionHistogram, PartitionKey};

    fn hist(entries: &[(&str, u64)]) -> PartitionHistogram {
        entries
            .iter()
            .map(|(k, v)| (PartitionKey::from(*k), *v))
            .collect()
    }

    fn stream_checkpoint(id: u64, stream: &str) -> Checkpoint {
        Checkpoint::new(
            id,
            CheckpointTarget::Stream(StreamKey::from(stream)),
            serde_json::json!({ "cursor": id }),
        )
    }

    fn coverage(stream: &str, entries: &[(&str, u64)]) -> CheckpointCoverage {
        CheckpointCoverage::new(
            entries
                .iter()
                .map(|(partition, records)| CoverageEntry {
                    stream: StreamKey::from(stream),
                    partition: PartitionKey::from(*partition),
                    records: *records,
                })
                .collect(),
        )
    }

    #[test]
    fn test_release_waits_for_registration_order() {
        let committed = EmissionStatsStore::new();
        let mut registry = CheckpointRegistry::new();
        registry.register(stream_checkpoint(1, "users"), coverage("users", &[("w1", 2)]));
        registry.register(stream_checkpoint(2, "users"), coverage("users", &[("w2", 1)]));

        // The later checkpoint's partitions flush first.
        committed.accept_stats(&StreamKey::from("users"), hist(&[("w2", 1)]), hist(&[]));
        let ready = registry.release_ready(&committed).expect("release failed");
        assert!(ready.is_empty());

        // Once the earlier one is covered, both pop in order.
        committed.accept_stats(&StreamKey::from("users"), hist(&[("w1", 2)]), hist(&[]));
        let ready = registry.release_ready(&committed).expect("release failed");
        let ids: Vec<u64> = ready.iter().map(|(cp, _)| cp.id()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_partial_coverage_keeps_checkpoint_pending() {
        let committed = EmissionStatsStore::new();
        let mut registry = CheckpointRegistry::new();
        registry.register(
            stream_checkpoint(1, "users"),
            coverage("users", &[("w1", 3), ("w2", 2)]),
        );

        committed.accept_stats(&StreamKey::from("users"), hist(&[("w1", 3)]), hist(&[]));
        assert!(registry
            .release_ready(&committed)
            .expect("release failed")
            .is_empty());

        committed.accept_stats(&StreamKey::from("users"), hist(&[("w2", 2)]), hist(&[]));
        let ready = registry.release_ready(&committed).expect("release failed");
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn test_independent_streams_release_independently() {
        let committed = EmissionStatsStore::new();
        let mut registry = CheckpointRegistry::new();
        registry.register(stream_checkpoint(1, "users"), coverage("users", &[("w1", 1)]));
        registry.register(
            stream_checkpoint(2, "orders"),
            coverage("orders", &[("w1", 1)]),
        );

        committed.accept_stats(&StreamKey::from("orders"), hist(&[("w1", 1)]), hist(&[]));
        let ready = registry.release_ready(&committed).expect("release failed");
        let ids: Vec<u64> = ready.iter().map(|(cp, _)| cp.id()).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_drain_pending_empties_registry() {
        let mut registry = CheckpointRegistry::new();
        registry.register(stream_checkpoint(1, "users"), coverage("users", &[("w1", 1)]));
        registry.register(
            Checkpoint::new(2, CheckpointTarget::Global, serde_json::Value::Null),
            CheckpointCoverage::default(),
        );

        let dropped = registry.drain_pending();
        assert_eq!(dropped.len(), 2);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_enricher_detects_bookkeeping_corruption() {
        let committed = Arc::new(EmissionStatsStore::new());
        let enricher = CheckpointEnricher::new(
            committed.clone(),
            Arc::new(PerStreamStatsStore::new()),
            Arc::new(MetricStatsStore::new()),
            Arc::new(AdditionalMetricsStore::new(Vec::new())),
        );
        // The coverage claims 5 records but only 3 were ever committed.
        committed.accept_stats(&StreamKey::from("users"), hist(&[("w1", 3)]), hist(&[]));
        let result = enricher.enrich(stream_checkpoint(1, "users"), coverage("users", &[("w1", 5)]));
        assert!(result.is_err());
    }

    #[test]
    fn test_enricher_attaches_committed_stats_and_full_metric_schema() {
        let committed = Arc::new(EmissionStatsStore::new());
        let additional = Arc::new(AdditionalMetricsStore::new(
            ["records.flushed".to_string(), "records.rejected".to_string()],
        ));
        let per_stream = Arc::new(PerStreamStatsStore::new());
        let enricher = CheckpointEnricher::new(
            committed.clone(),
            per_stream.clone(),
            Arc::new(MetricStatsStore::new()),
            additional.clone(),
        );

        let users = StreamKey::from("users");
        committed.accept_stats(&users, hist(&[("w1", 4)]), hist(&[("w1", 400)]));
        additional.add(&users, "records.flushed", PartitionKey::from("w1"), 4.0);

        let enriched = enricher
            .enrich(stream_checkpoint(7, "users"), coverage("users", &[("w1", 4)]))
            .expect("enrich failed");

        assert_eq!(enriched.stats(), EmissionStats::new(4, 400));
        assert_eq!(enriched.metrics().get("records.flushed"), Some(&4.0));
        assert_eq!(enriched.metrics().get("records.rejected"), Some(&0.0));
        // Live stats for the covered partitions were evicted.
        assert_eq!(committed.live(&users), EmissionStats::default());
        assert_eq!(per_stream.run_total(), EmissionStats::new(4, 400));
    }
}
