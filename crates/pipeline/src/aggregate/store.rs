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
    aggregate::{
        batch::{Aggregate, CloseReason},
        estimator::{EstimationError, SizeEstimator},
        trigger::TriggerPolicy,
    },
    message::ChangeRecord,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use sluice_stats::StreamKey;
use std::time::Instant;
use tracing::debug;

/// Registry of open aggregates for one pipeline shard.
///
/// At most one aggregate is open per stream. The store is owned by a single
/// aggregation worker, which serializes accumulation per stream; it is
/// never shared across shards.
#[derive(Debug)]
pub struct AggregateStore<E> {
    open: FxHashMap<StreamKey, Aggregate>,
    total_open_bytes: u64,
    next_index: u64,
    policy: TriggerPolicy,
    estimator: E,
}

impl<E: SizeEstimator> AggregateStore<E> {
    pub fn new(policy: TriggerPolicy, estimator: E) -> Self {
        Self {
            open: FxHashMap::default(),
            total_open_bytes: 0,
            next_index: 0,
            policy,
            estimator,
        }
    }

    /// Buffer one record, returning the aggregates this call closed: any
    /// evictions needed to keep the open set under the global byte budget,
    /// then the record's own aggregate if it hit a per-aggregate limit.
    ///
    /// Estimation failures are scoped to the record: nothing is buffered
    /// and no byte accounting changes.
    pub fn accumulate(
        &mut self,
        record: ChangeRecord,
    ) -> Result<SmallVec<[Aggregate; 2]>, EstimationError> {
        let estimated_size = self.estimator.estimate(&record)? as u64;
        let mut closed = SmallVec::new();

        // Make room before accepting the record: close the largest open
        // aggregate until the incoming bytes fit under the global budget.
        while self
            .policy
            .over_global_budget(self.total_open_bytes, estimated_size)
        {
            let Some(victim) = self.policy.select_eviction(self.open.values()) else {
                break;
            };
            debug!(
                "Global byte budget reached, closing largest open aggregate for stream {victim}"
            );
            if let Some(aggregate) = self.close_stream(&victim, CloseReason::GlobalByteBudget) {
                closed.push(aggregate);
            }
        }

        let stream = record.stream().clone();
        let Self {
            open, next_index, ..
        } = self;
        let aggregate = open.entry(stream.clone()).or_insert_with(|| {
            let index = *next_index;
            *next_index += 1;
            Aggregate::new(stream.clone(), index)
        });
        aggregate.push(record, estimated_size);
        self.total_open_bytes = self.total_open_bytes.saturating_add(estimated_size);

        if let Some(reason) = self
            .open
            .get(&stream)
            .and_then(|aggregate| self.policy.evaluate(aggregate))
        {
            if let Some(aggregate) = self.close_stream(&stream, reason) {
                closed.push(aggregate);
            }
        }
        Ok(closed)
    }

    /// Close every open aggregate whose staleness deadline has passed.
    /// Driven by a periodic sweep so streams that stop receiving data still
    /// flush promptly.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<Aggregate> {
        let stale: Vec<StreamKey> = self
            .open
            .iter()
            .filter(|(_, aggregate)| self.policy.is_stale(aggregate, now))
            .map(|(stream, _)| stream.clone())
            .collect();
        stale
            .iter()
            .filter_map(|stream| self.close_stream(stream, CloseReason::Stale))
            .collect()
    }

    /// Close every open aggregate unconditionally, in creation order. Used
    /// on stream completion or pipeline failure.
    pub fn force_flush_all(&mut self) -> Vec<Aggregate> {
        let streams: Vec<StreamKey> = self.open.keys().cloned().collect();
        let mut closed: Vec<Aggregate> = streams
            .iter()
            .filter_map(|stream| self.close_stream(stream, CloseReason::EndOfStream))
            .collect();
        closed.sort_by_key(Aggregate::index);
        closed
    }

    fn close_stream(&mut self, stream: &StreamKey, reason: CloseReason) -> Option<Aggregate> {
        let mut aggregate = self.open.remove(stream)?;
        aggregate.close(reason);
        self.total_open_bytes = self
            .total_open_bytes
            .saturating_sub(aggregate.estimated_bytes());
        Some(aggregate)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn total_open_bytes(&self) -> u64 {
        self.total_open_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn open_aggregate(&self, stream: &StreamKey) -> Option<&Aggregate> {
        self.open.get(stream)
    }
}
