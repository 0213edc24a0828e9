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

//! `{count, bytes}` pairs with associative merge, used for emitted and
//! committed totals.

use crate::histogram::{PartitionHistogram, PartitionKey};
use serde::{Deserialize, Serialize};

/// Record and byte totals for some unit of work (a partition, a stream, a
/// whole run). Merge is associative and commutative.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EmissionStats {
    pub count: u64,
    pub bytes: u64,
}

impl EmissionStats {
    pub const fn new(count: u64, bytes: u64) -> Self {
        Self { count, bytes }
    }

    pub fn merge(&mut self, other: Self) {
        self.count = self.count.saturating_add(other.count);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0 && self.bytes == 0
    }
}

impl std::fmt::Display for EmissionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} records / {} bytes", self.count, self.bytes)
    }
}

/// Per-partition record and byte counters for one stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartitionStats {
    counts: PartitionHistogram,
    bytes: PartitionHistogram,
}

impl PartitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, partition: PartitionKey, count: u64, bytes: u64) {
        self.counts.record(partition.clone(), count);
        self.bytes.record(partition, bytes);
    }

    /// Fold another set of per-partition contributions into this one.
    pub fn merge(&mut self, counts: PartitionHistogram, bytes: PartitionHistogram) {
        self.counts.merge(counts);
        self.bytes.merge(bytes);
    }

    pub fn partition(&self, partition: &PartitionKey) -> EmissionStats {
        EmissionStats::new(self.counts.get(partition), self.bytes.get(partition))
    }

    pub fn partition_count(&self, partition: &PartitionKey) -> u64 {
        self.counts.get(partition)
    }

    /// Remove every partition, returning each lane's totals.
    pub fn drain_all(&mut self) -> Vec<(PartitionKey, EmissionStats)> {
        let mut lanes: Vec<PartitionKey> = self.counts.keys().cloned().collect();
        for lane in self.bytes.keys() {
            if !lanes.contains(lane) {
                lanes.push(lane.clone());
            }
        }
        lanes
            .into_iter()
            .map(|lane| {
                let stats =
                    EmissionStats::new(self.counts.remove(&lane), self.bytes.remove(&lane));
                (lane, stats)
            })
            .collect()
    }

    /// Remove the named partitions, returning their summed totals.
    /// Removing an absent partition contributes zero.
    pub fn remove(&mut self, partitions: &[PartitionKey]) -> EmissionStats {
        let mut removed = EmissionStats::default();
        for partition in partitions {
            removed.merge(EmissionStats::new(
                self.counts.remove(partition),
                self.bytes.remove(partition),
            ));
        }
        removed
    }

    pub fn totals(&self) -> EmissionStats {
        EmissionStats::new(self.counts.total(), self.bytes.total())
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emission_merge() {
        let mut stats = EmissionStats::new(2, 100);
        stats.merge(EmissionStats::new(3, 50));
        assert_eq!(stats, EmissionStats::new(5, 150));
        assert!(!stats.is_empty());
        assert!(EmissionStats::default().is_empty());
    }

    #[test]
    fn test_partition_stats_remove_returns_pre_removal_sum() {
        let mut stats = PartitionStats::new();
        stats.record(PartitionKey::from("p0"), 5, 500);
        stats.record(PartitionKey::from("p1"), 3, 300);
        stats.record(PartitionKey::from("p2"), 1, 100);

        let removed = stats.remove(&[PartitionKey::from("p0"), PartitionKey::from("p1")]);
        assert_eq!(removed, EmissionStats::new(8, 800));
        assert_eq!(stats.totals(), EmissionStats::new(1, 100));

        // Second removal of the same partitions finds nothing.
        let removed = stats.remove(&[PartitionKey::from("p0"), PartitionKey::from("p1")]);
        assert_eq!(removed, EmissionStats::default());
    }
}
