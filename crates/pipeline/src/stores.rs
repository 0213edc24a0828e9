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

//! Process-wide stats stores shared by all pipeline instances.

use crate::{
    collaborators::CoverageProvider,
    message::{Checkpoint, CheckpointCoverage, CheckpointTarget, CoverageEntry},
};
use sluice_stats::store::{
    AdditionalMetricsStore, EmissionStatsStore, MetricStatsStore, PerStreamStatsStore,
};
use std::sync::Arc;

/// Metric key for records written to the destination, always present on
/// enriched checkpoints.
pub const METRIC_RECORDS_FLUSHED: &str = "records.flushed";
/// Metric key for bytes written to the destination, always present on
/// enriched checkpoints.
pub const METRIC_BYTES_FLUSHED: &str = "bytes.flushed";

/// The shared mutable stats state of the process: one emitted and one
/// committed ledger, per-stream reporting totals and the auxiliary metric
/// stores. Aggregate stores are deliberately *not* here; they are owned by
/// their shard.
pub struct StatsRegistry {
    /// Records observed by the parse stage, per partition lane. Drained by
    /// the coverage bookkeeper when a checkpoint claims its lanes.
    pub emitted: Arc<EmissionStatsStore>,
    /// Records confirmed written by the destination, per partition lane.
    /// Drained when a checkpoint releases.
    pub committed: Arc<EmissionStatsStore>,
    pub per_stream: Arc<PerStreamStatsStore>,
    pub metrics: Arc<MetricStatsStore>,
    pub additional: Arc<AdditionalMetricsStore>,
}

impl StatsRegistry {
    /// Build the registry. `additional_metrics` extends the built-in flush
    /// metric keys carried on every enriched checkpoint.
    pub fn new(additional_metrics: Vec<String>) -> Self {
        let mut declared = vec![
            METRIC_RECORDS_FLUSHED.to_string(),
            METRIC_BYTES_FLUSHED.to_string(),
        ];
        for key in additional_metrics {
            if !declared.contains(&key) {
                declared.push(key);
            }
        }
        Self {
            emitted: Arc::new(EmissionStatsStore::new()),
            committed: Arc::new(EmissionStatsStore::new()),
            per_stream: Arc::new(PerStreamStatsStore::new()),
            metrics: Arc::new(MetricStatsStore::new()),
            additional: Arc::new(AdditionalMetricsStore::new(declared)),
        }
    }
}

/// Coverage bookkeeper backed by the emitted ledger: a checkpoint claims
/// every partition lane its target accumulated since the previous
/// checkpoint. Lanes must not be reused across checkpoint windows of the
/// same stream.
pub struct EmittedCoverageProvider {
    emitted: Arc<EmissionStatsStore>,
}

impl EmittedCoverageProvider {
    pub fn new(emitted: Arc<EmissionStatsStore>) -> Self {
        Self { emitted }
    }
}

impl CoverageProvider for EmittedCoverageProvider {
    fn coverage(&self, checkpoint: &Checkpoint) -> CheckpointCoverage {
        let mut entries = Vec::new();
        match checkpoint.target() {
            CheckpointTarget::Stream(stream) => {
                for (partition, stats) in self.emitted.drain_live_partitions(stream) {
                    entries.push(CoverageEntry {
                        stream: stream.clone(),
                        partition,
                        records: stats.count,
                    });
                }
            }
            CheckpointTarget::Global => {
                for (stream, lanes) in self.emitted.drain_all_live_partitions() {
                    for (partition, stats) in lanes {
                        entries.push(CoverageEntry {
                            stream: stream.clone(),
                            partition,
                            records: stats.count,
                        });
                    }
                }
            }
        }
        CheckpointCoverage::new(entries)
    }
}
