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

//! Mergeable counter maps keyed by partition or stream.
//!
//! [`Histogram`] is the building block for all per-partition accounting in
//! the engine: a map from key to a saturating `u64` accumulator whose
//! `merge` is associative and commutative, so contributions can be combined
//! in any order by any number of workers without losing updates.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// Identity of a destination stream.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StreamKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Identity of an ordering lane within a stream.
///
/// Lanes are counted independently for checkpoint accounting; the producer
/// is responsible for not reusing a lane across checkpoint windows of the
/// same stream.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for PartitionKey {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// A mergeable counter map: key -> accumulated `u64`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram<K: Eq + Hash> {
    counters: FxHashMap<K, u64>,
}

/// Counter map keyed by partition, specialized to record or byte counts.
pub type PartitionHistogram = Histogram<PartitionKey>;

impl<K: Eq + Hash> Default for Histogram<K> {
    fn default() -> Self {
        Self {
            counters: FxHashMap::default(),
        }
    }
}

impl<K: Eq + Hash> Histogram<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the accumulator for `key`.
    pub fn record(&mut self, key: K, delta: u64) {
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
    }

    /// Fold `other` into `self`. Associative and commutative.
    pub fn merge(&mut self, other: Self) {
        for (key, delta) in other.counters {
            self.record(key, delta);
        }
    }

    pub fn get(&self, key: &K) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Remove `key` and return its accumulated value (0 if absent).
    pub fn remove(&mut self, key: &K) -> u64 {
        self.counters.remove(key).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counters.values().fold(0, |acc, v| acc.saturating_add(*v))
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, u64)> {
        self.counters.iter().map(|(k, v)| (k, *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.counters.keys()
    }
}

impl<K: Eq + Hash> FromIterator<(K, u64)> for Histogram<K> {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        let mut histogram = Self::new();
        for (key, delta) in iter {
            histogram.record(key, delta);
        }
        histogram
    }
}

impl<K: Eq + Hash> IntoIterator for Histogram<K> {
    type Item = (K, u64);
    type IntoIter = <FxHashMap<K, u64> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.counters.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram(entries: &[(&str, u64)]) -> PartitionHistogram {
        entries
            .iter()
            .map(|(k, v)| (PartitionKey::from(*k), *v))
            .collect()
    }

    #[test]
    fn test_record_accumulates() {
        let mut h = PartitionHistogram::new();
        h.record(PartitionKey::from("p0"), 3);
        h.record(PartitionKey::from("p0"), 4);
        h.record(PartitionKey::from("p1"), 1);
        assert_eq!(h.get(&PartitionKey::from("p0")), 7);
        assert_eq!(h.get(&PartitionKey::from("p1")), 1);
        assert_eq!(h.get(&PartitionKey::from("p2")), 0);
        assert_eq!(h.total(), 8);
    }

    #[test]
    fn test_merge_commutative() {
        let a = histogram(&[("p0", 1), ("p1", 2)]);
        let b = histogram(&[("p1", 3), ("p2", 5)]);

        let mut ab = a.clone();
        ab.merge(b.clone());
        let mut ba = b;
        ba.merge(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.get(&PartitionKey::from("p1")), 5);
    }

    #[test]
    fn test_merge_associative() {
        let a = histogram(&[("p0", 1)]);
        let b = histogram(&[("p0", 2), ("p1", 7)]);
        let c = histogram(&[("p1", 1), ("p2", 9)]);

        // (a + b) + c
        let mut left = a.clone();
        left.merge(b.clone());
        left.merge(c.clone());

        // a + (b + c)
        let mut bc = b;
        bc.merge(c);
        let mut right = a;
        right.merge(bc);

        assert_eq!(left, right);
        assert_eq!(left.total(), 20);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut h = histogram(&[("p0", 4)]);
        assert_eq!(h.remove(&PartitionKey::from("p0")), 4);
        assert_eq!(h.remove(&PartitionKey::from("p0")), 0);
        assert!(h.is_empty());
    }
}
