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

//! Auxiliary per-partition metric stores.
//!
//! [`MetricStatsStore`] holds free-form named `u64` counters. The
//! [`AdditionalMetricsStore`] holds `f64` gauges for a fixed, declared key
//! set and guarantees completeness: every drain returns a value for every
//! declared key, defaulting absent ones to `0.0`, so checkpoint payloads
//! carry a stable schema even for windows with no events for a metric.

use crate::{
    histogram::{PartitionHistogram, PartitionKey, StreamKey},
    store::ShardedByStream,
};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::warn;

/// Named auxiliary `u64` counters per partition, same accept/drain contract
/// as the emission stores.
#[derive(Default)]
pub struct MetricStatsStore {
    inner: ShardedByStream<FxHashMap<String, PartitionHistogram>>,
}

impl MetricStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stream: &StreamKey, metric: &str, partition: PartitionKey, delta: u64) {
        self.inner.with_entry(stream, |metrics| {
            metrics
                .entry(metric.to_string())
                .or_default()
                .record(partition, delta);
        });
    }

    /// Atomically remove the named partitions from every metric of the
    /// stream, returning the per-metric sums of what was removed.
    pub fn drain(
        &self,
        stream: &StreamKey,
        partitions: &[PartitionKey],
    ) -> FxHashMap<String, u64> {
        self.inner
            .with_existing(stream, |metrics| {
                let mut drained = FxHashMap::default();
                for (metric, histogram) in metrics.iter_mut() {
                    let mut removed = 0u64;
                    for partition in partitions {
                        removed = removed.saturating_add(histogram.remove(partition));
                    }
                    if removed > 0 {
                        drained.insert(metric.clone(), removed);
                    }
                }
                drained
            })
            .unwrap_or_default()
    }

    pub fn get(&self, stream: &StreamKey, metric: &str, partition: &PartitionKey) -> u64 {
        self.inner
            .with_existing(stream, |metrics| {
                metrics.get(metric).map(|h| h.get(partition)).unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

/// `f64` metrics for a declared key set, attached to checkpoint payloads.
pub struct AdditionalMetricsStore {
    /// Declared keys in a stable order; drains always cover all of them.
    declared: IndexMap<String, ()>,
    inner: ShardedByStream<FxHashMap<String, FxHashMap<PartitionKey, f64>>>,
}

impl AdditionalMetricsStore {
    pub fn new(declared: impl IntoIterator<Item = String>) -> Self {
        Self {
            declared: declared.into_iter().map(|key| (key, ())).collect(),
            inner: ShardedByStream::default(),
        }
    }

    pub fn declared_keys(&self) -> impl Iterator<Item = &str> {
        self.declared.keys().map(String::as_str)
    }

    /// Add `value` to the live accumulator for `(stream, partition,
    /// metric)`. Values for undeclared metrics are dropped: the drained
    /// schema is fixed at construction.
    pub fn add(&self, stream: &StreamKey, metric: &str, partition: PartitionKey, value: f64) {
        if !self.declared.contains_key(metric) {
            warn!("Dropping value for undeclared metric `{metric}` on stream {stream}");
            return;
        }
        self.inner.with_entry(stream, |metrics| {
            let slot = metrics
                .entry(metric.to_string())
                .or_default()
                .entry(partition)
                .or_insert(0.0);
            *slot += value;
        });
    }

    /// Remove the named partitions and return the summed value for every
    /// declared metric key, with absent values defaulting to `0.0`. The
    /// default is applied explicitly at read time; a drain never creates
    /// entries in the live state.
    pub fn drain(
        &self,
        stream: &StreamKey,
        partitions: &[PartitionKey],
    ) -> IndexMap<String, f64> {
        let mut drained: IndexMap<String, f64> = self
            .declared
            .keys()
            .map(|key| (key.clone(), 0.0))
            .collect();
        self.inner.with_existing(stream, |metrics| {
            for (metric, values) in metrics.iter_mut() {
                let mut removed = 0.0;
                for partition in partitions {
                    removed += values.remove(partition).unwrap_or(0.0);
                }
                if let Some(slot) = drained.get_mut(metric) {
                    *slot += removed;
                }
            }
        });
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(keys: &[&str]) -> Vec<PartitionKey> {
        keys.iter().map(|k| PartitionKey::from(*k)).collect()
    }

    #[test]
    fn test_metric_store_drain_is_idempotent() {
        let store = MetricStatsStore::new();
        let stream = StreamKey::from("users");
        store.add(&stream, "records.rejected", PartitionKey::from("p0"), 2);
        store.add(&stream, "records.rejected", PartitionKey::from("p1"), 3);

        let drained = store.drain(&stream, &partitions(&["p0", "p1"]));
        assert_eq!(drained.get("records.rejected"), Some(&5));

        let drained = store.drain(&stream, &partitions(&["p0", "p1"]));
        assert!(drained.is_empty());
    }

    #[test]
    fn test_drain_returns_every_declared_key() {
        let store = AdditionalMetricsStore::new(
            ["records.flushed", "bytes.flushed", "records.rejected"]
                .into_iter()
                .map(String::from),
        );
        let stream = StreamKey::from("users");
        store.add(&stream, "records.flushed", PartitionKey::from("p0"), 4.0);

        let drained = store.drain(&stream, &partitions(&["p0"]));
        assert_eq!(drained.len(), 3);
        assert_eq!(drained.get("records.flushed"), Some(&4.0));
        assert_eq!(drained.get("bytes.flushed"), Some(&0.0));
        assert_eq!(drained.get("records.rejected"), Some(&0.0));

        // A stream with no events at all still gets the full schema.
        let drained = store.drain(&StreamKey::from("orders"), &partitions(&["p9"]));
        assert_eq!(drained.len(), 3);
        assert!(drained.values().all(|v| *v == 0.0));
    }

    #[test]
    fn test_drain_order_independent_of_add_order() {
        let declared = ["a", "b"].into_iter().map(String::from);
        let left = AdditionalMetricsStore::new(declared.clone());
        let right = AdditionalMetricsStore::new(declared);
        let stream = StreamKey::from("users");

        left.add(&stream, "a", PartitionKey::from("p0"), 1.0);
        left.add(&stream, "b", PartitionKey::from("p0"), 2.0);
        right.add(&stream, "b", PartitionKey::from("p0"), 2.0);
        right.add(&stream, "a", PartitionKey::from("p0"), 1.0);

        assert_eq!(
            left.drain(&stream, &partitions(&["p0"])),
            right.drain(&stream, &partitions(&["p0"]))
        );
    }

    #[test]
    fn test_undeclared_metric_is_dropped() {
        let store = AdditionalMetricsStore::new(["a".to_string()]);
        let stream = StreamKey::from("users");
        store.add(&stream, "mystery", PartitionKey::from("p0"), 9.0);

        let drained = store.drain(&stream, &partitions(&["p0"]));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.get("a"), Some(&0.0));
    }
}
