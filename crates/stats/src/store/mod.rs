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

//! Concurrency-safe stats stores shared across pipeline instances.
//!
//! All stores follow the same contract:
//! - `accept`-style calls merge into a live, uncommitted accumulator with an
//!   associative merge; no update is lost under concurrent callers.
//! - `commit`/`drain` atomically removes the named partitions and returns
//!   what was removed; repeated calls for already-removed partitions return
//!   zero.
//!
//! The maps are sharded by stream key so that many pipeline instances
//! updating disjoint streams do not contend on a single lock.

mod emission;
mod metrics;
mod scope;

pub use emission::EmissionStatsStore;
pub use metrics::{AdditionalMetricsStore, MetricStatsStore};
pub use scope::{CheckpointScope, PerStreamStatsStore};

use crate::histogram::StreamKey;
use rustc_hash::{FxHashMap, FxHasher};
use std::{
    hash::{Hash, Hasher},
    sync::{Mutex, PoisonError},
};

const SHARD_COUNT: usize = 16;

/// A stream-keyed map split over a fixed number of mutex-guarded shards.
pub(crate) struct ShardedByStream<V> {
    shards: Box<[Mutex<FxHashMap<StreamKey, V>>]>,
}

impl<V> Default for ShardedByStream<V> {
    fn default() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self { shards }
    }
}

impl<V> ShardedByStream<V> {
    fn shard(&self, stream: &StreamKey) -> &Mutex<FxHashMap<StreamKey, V>> {
        let mut hasher = FxHasher::default();
        stream.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    /// Run `f` over the entry for `stream`, creating it with `V::default()`
    /// when absent. The shard lock is held for the duration of `f`.
    pub(crate) fn with_entry<R>(&self, stream: &StreamKey, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut guard = self
            .shard(stream)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(guard.entry(stream.clone()).or_default())
    }

    /// Run `f` over the entry for `stream` if it exists.
    pub(crate) fn with_existing<R>(
        &self,
        stream: &StreamKey,
        f: impl FnOnce(&mut V) -> R,
    ) -> Option<R> {
        let mut guard = self
            .shard(stream)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.get_mut(stream).map(f)
    }

    /// Visit every entry, one shard lock at a time.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&StreamKey, &mut V)) {
        for shard in self.shards.iter() {
            let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (stream, value) in guard.iter_mut() {
                f(stream, value);
            }
        }
    }
}
