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
    emission::{EmissionStats, PartitionStats},
    histogram::{PartitionHistogram, PartitionKey, StreamKey},
    store::ShardedByStream,
};

#[derive(Default)]
struct StreamSlot {
    /// Live per-partition contributions not yet claimed by a checkpoint.
    live: PartitionStats,
    /// Stream-scoped cumulative total; survives partition removal.
    lifetime: EmissionStats,
}

/// Tracks per-partition record/byte counts for one side of the ledger
/// (emitted into aggregates, or committed to the destination).
///
/// Shared mutable state across all pipeline instances in the process,
/// keyed by stream identity.
#[derive(Default)]
pub struct EmissionStatsStore {
    inner: ShardedByStream<StreamSlot>,
}

impl EmissionStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge per-partition contributions into the live accumulator.
    pub fn accept_stats(
        &self,
        stream: &StreamKey,
        counts: PartitionHistogram,
        bytes: PartitionHistogram,
    ) {
        self.inner
            .with_entry(stream, |slot| slot.live.merge(counts, bytes));
    }

    /// Atomically remove the named partitions from the live stats and
    /// return their summed totals. The removed contribution is folded into
    /// the stream's lifetime total. Partitions already removed contribute
    /// zero, so repeated commits are idempotent.
    pub fn commit(&self, stream: &StreamKey, partitions: &[PartitionKey]) -> EmissionStats {
        self.inner.with_entry(stream, |slot| {
            let removed = slot.live.remove(partitions);
            slot.lifetime.merge(removed);
            removed
        })
    }

    /// Live (uncommitted) record count for one partition.
    pub fn partition_count(&self, stream: &StreamKey, partition: &PartitionKey) -> u64 {
        self.inner
            .with_existing(stream, |slot| slot.live.partition_count(partition))
            .unwrap_or(0)
    }

    /// Live (uncommitted) totals for one stream.
    pub fn live(&self, stream: &StreamKey) -> EmissionStats {
        self.inner
            .with_existing(stream, |slot| slot.live.totals())
            .unwrap_or_default()
    }

    /// Cumulative committed total for one stream over the whole run.
    pub fn lifetime(&self, stream: &StreamKey) -> EmissionStats {
        self.inner
            .with_existing(stream, |slot| slot.lifetime)
            .unwrap_or_default()
    }

    /// Atomically claim every live partition of a stream: the lanes are
    /// removed, folded into the lifetime total, and returned with their
    /// individual totals. Used to capture the covering set of a checkpoint
    /// at its observation instant.
    pub fn drain_live_partitions(&self, stream: &StreamKey) -> Vec<(PartitionKey, EmissionStats)> {
        self.inner
            .with_existing(stream, |slot| {
                let lanes = slot.live.drain_all();
                for (_, stats) in &lanes {
                    slot.lifetime.merge(*stats);
                }
                lanes
            })
            .unwrap_or_default()
    }

    /// [`Self::drain_live_partitions`] over every stream in the store.
    pub fn drain_all_live_partitions(
        &self,
    ) -> Vec<(StreamKey, Vec<(PartitionKey, EmissionStats)>)> {
        let mut drained = Vec::new();
        self.inner.for_each(|stream, slot| {
            let lanes = slot.live.drain_all();
            if !lanes.is_empty() {
                for (_, stats) in &lanes {
                    slot.lifetime.merge(*stats);
                }
                drained.push((stream.clone(), lanes));
            }
        });
        drained
    }

    /// Drop all live stats for a stream, e.g. when the pipeline instance
    /// owning the stream failed and its uncommitted work is abandoned.
    /// Lifetime totals are kept.
    pub fn discard_live(&self, stream: &StreamKey) -> EmissionStats {
        self.inner
            .with_existing(stream, |slot| {
                let discarded = slot.live.totals();
                slot.live = PartitionStats::new();
                discarded
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(entries: &[(&str, u64)]) -> PartitionHistogram {
        entries
            .iter()
            .map(|(k, v)| (PartitionKey::from(*k), *v))
            .collect()
    }

    #[test]
    fn test_commit_drains_exactly_the_requested_partitions() {
        let store = EmissionStatsStore::new();
        let stream = StreamKey::from("users");
        store.accept_stats(&stream, hist(&[("p0", 5), ("p1", 3)]), hist(&[("p0", 500), ("p1", 300)]));

        let committed = store.commit(&stream, &[PartitionKey::from("p0")]);
        assert_eq!(committed, EmissionStats::new(5, 500));
        assert_eq!(store.live(&stream), EmissionStats::new(3, 300));
        assert_eq!(store.partition_count(&stream, &PartitionKey::from("p1")), 3);

        // A second commit of the already-removed partition returns zero.
        let committed = store.commit(&stream, &[PartitionKey::from("p0")]);
        assert_eq!(committed, EmissionStats::default());
    }

    #[test]
    fn test_lifetime_survives_partition_removal() {
        let store = EmissionStatsStore::new();
        let stream = StreamKey::from("orders");
        store.accept_stats(&stream, hist(&[("p0", 2)]), hist(&[("p0", 20)]));
        store.commit(&stream, &[PartitionKey::from("p0")]);
        store.accept_stats(&stream, hist(&[("p1", 4)]), hist(&[("p1", 40)]));
        store.commit(&stream, &[PartitionKey::from("p1")]);

        assert_eq!(store.live(&stream), EmissionStats::default());
        assert_eq!(store.lifetime(&stream), EmissionStats::new(6, 60));
    }

    #[test]
    fn test_concurrent_accepts_lose_no_updates() {
        let store = std::sync::Arc::new(EmissionStatsStore::new());
        let stream = StreamKey::from("events");
        let mut joins = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let stream = stream.clone();
            joins.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store.accept_stats(&stream, hist(&[("p0", 1)]), hist(&[("p0", 10)]));
                }
            }));
        }
        for join in joins {
            join.join().expect("accept thread panicked");
        }
        assert_eq!(store.live(&stream), EmissionStats::new(800, 8000));
    }

    #[test]
    fn test_discard_live_keeps_lifetime() {
        let store = EmissionStatsStore::new();
        let stream = StreamKey::from("users");
        store.accept_stats(&stream, hist(&[("p0", 2)]), hist(&[("p0", 20)]));
        store.commit(&stream, &[PartitionKey::from("p0")]);
        store.accept_stats(&stream, hist(&[("p1", 7)]), hist(&[("p1", 70)]));

        let discarded = store.discard_live(&stream);
        assert_eq!(discarded, EmissionStats::new(7, 70));
        assert_eq!(store.live(&stream), EmissionStats::default());
        assert_eq!(store.lifetime(&stream), EmissionStats::new(2, 20));
    }
}
