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
    aggregate::batch::{Aggregate, CloseReason},
    config::TriggerConfig,
};
use sluice_stats::StreamKey;
use std::time::{Duration, Instant};

/// Pure decision function over aggregate state and configured thresholds.
#[derive(Clone, Copy, Debug)]
pub struct TriggerPolicy {
    max_records_per_aggregate: u64,
    max_bytes_per_aggregate: u64,
    staleness_deadline: Duration,
    max_bytes_all_aggregates: u64,
}

impl TriggerPolicy {
    /// Build from an already-validated [`TriggerConfig`].
    pub fn from_config(config: &TriggerConfig) -> Self {
        Self {
            max_records_per_aggregate: config.max_records_per_aggregate,
            max_bytes_per_aggregate: config.max_bytes_per_aggregate,
            staleness_deadline: config.staleness_deadline,
            max_bytes_all_aggregates: config.max_bytes_all_aggregates,
        }
    }

    /// Per-aggregate triggers, checked after every write.
    pub fn evaluate(&self, aggregate: &Aggregate) -> Option<CloseReason> {
        if aggregate.record_count() >= self.max_records_per_aggregate {
            return Some(CloseReason::RecordLimit);
        }
        if aggregate.estimated_bytes() >= self.max_bytes_per_aggregate {
            return Some(CloseReason::ByteLimit);
        }
        None
    }

    /// Staleness trigger, checked by the periodic sweep.
    pub fn is_stale(&self, aggregate: &Aggregate, now: Instant) -> bool {
        now.saturating_duration_since(aggregate.last_write_at()) >= self.staleness_deadline
    }

    /// Cross-aggregate trigger: would accepting `incoming_bytes` push the
    /// sum of open aggregates over the global budget?
    pub fn over_global_budget(&self, total_open_bytes: u64, incoming_bytes: u64) -> bool {
        total_open_bytes.saturating_add(incoming_bytes) >= self.max_bytes_all_aggregates
    }

    /// Pick the eviction victim: the single largest open aggregate (greedy,
    /// bounding the number of evictions needed to return under budget).
    /// Ties are broken deterministically by oldest creation time.
    pub fn select_eviction<'a>(
        &self,
        open: impl Iterator<Item = &'a Aggregate>,
    ) -> Option<StreamKey> {
        let mut victim: Option<&Aggregate> = None;
        for candidate in open {
            let better = match victim {
                None => true,
                Some(best) => {
                    candidate.estimated_bytes() > best.estimated_bytes()
                        || (candidate.estimated_bytes() == best.estimated_bytes()
                            && candidate.created_at() < best.created_at())
                }
            };
            if better {
                victim = Some(candidate);
            }
        }
        victim.map(|aggregate| aggregate.stream().clone())
    }
}
