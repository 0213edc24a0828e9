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

use crate::{emission::EmissionStats, histogram::StreamKey, store::ShardedByStream};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::info;

/// Whether checkpoints observed in this run target a single stream or the
/// whole connector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display, serde::Serialize, serde::Deserialize)]
pub enum CheckpointScope {
    PerStream,
    Global,
}

/// Stream-scoped committed totals for reporting.
///
/// The scope of a run is decided by the first checkpoint observed. A global
/// checkpoint cannot be unambiguously attributed to one stream's
/// partitions, so once `Global` is detected, per-stream totals are
/// permanently disabled for the run and only the run-wide total is kept.
#[derive(Default)]
pub struct PerStreamStatsStore {
    scope: OnceLock<CheckpointScope>,
    per_stream: ShardedByStream<EmissionStats>,
    run_total: Mutex<EmissionStats>,
}

impl PerStreamStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the scope of an observed checkpoint. The first observation
    /// wins; the effective scope for the run is returned.
    pub fn observe_scope(&self, scope: CheckpointScope) -> CheckpointScope {
        let effective = *self.scope.get_or_init(|| {
            if scope == CheckpointScope::Global {
                info!("Global checkpoint detected, disabling per-stream stats aggregation");
            }
            scope
        });
        effective
    }

    /// The detected scope, if any checkpoint was observed yet.
    pub fn scope(&self) -> Option<CheckpointScope> {
        self.scope.get().copied()
    }

    /// Fold a committed contribution into the run total and, unless the
    /// run is globally checkpointed, into the stream's total.
    pub fn record_commit(&self, stream: &StreamKey, stats: EmissionStats) {
        self.run_total
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(stats);
        if self.scope() != Some(CheckpointScope::Global) {
            self.per_stream
                .with_entry(stream, |total| total.merge(stats));
        }
    }

    /// Committed total for one stream. `None` when cross-stream
    /// aggregation is disabled for the run.
    pub fn stream_total(&self, stream: &StreamKey) -> Option<EmissionStats> {
        if self.scope() == Some(CheckpointScope::Global) {
            return None;
        }
        Some(
            self.per_stream
                .with_existing(stream, |total| *total)
                .unwrap_or_default(),
        )
    }

    pub fn run_total(&self) -> EmissionStats {
        *self
            .run_total
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
