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

//! Input message model.
//!
//! Everything the engine reads from a source is one of the [`SourceItem`]
//! variants; the parse stage dispatches over them with a single exhaustive
//! match rather than spreading type checks across modules.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sluice_stats::{
    store::CheckpointScope, EmissionStats, PartitionKey, StreamKey,
};

/// One change record bound for a destination stream, tagged with the
/// ordering lane it is counted under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    stream: StreamKey,
    partition: PartitionKey,
    payload: serde_json::Value,
}

impl ChangeRecord {
    pub fn new(stream: StreamKey, partition: PartitionKey, payload: serde_json::Value) -> Self {
        Self {
            stream,
            partition,
            payload,
        }
    }

    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// What a checkpoint applies to. A global checkpoint cannot be attributed
/// to a single stream's partitions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTarget {
    Stream(StreamKey),
    Global,
}

/// A marker meaning "all records up to this point have been read". It must
/// only be acknowledged downstream once every record it covers has been
/// committed to the destination.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    id: u64,
    target: CheckpointTarget,
    payload: serde_json::Value,
}

impl Checkpoint {
    pub fn new(id: u64, target: CheckpointTarget, payload: serde_json::Value) -> Self {
        Self {
            id,
            target,
            payload,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &CheckpointTarget {
        &self.target
    }

    pub fn scope(&self) -> CheckpointScope {
        match &self.target {
            CheckpointTarget::Stream(_) => CheckpointScope::PerStream,
            CheckpointTarget::Global => CheckpointScope::Global,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

/// One `(stream, partition) -> record count` contribution a checkpoint
/// covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageEntry {
    pub stream: StreamKey,
    pub partition: PartitionKey,
    pub records: u64,
}

/// The set of contributions that must all be confirmed committed before a
/// checkpoint is released, captured at the instant the checkpoint was
/// observed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCoverage {
    entries: Vec<CoverageEntry>,
}

impl CheckpointCoverage {
    pub fn new(entries: Vec<CoverageEntry>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoverageEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_records(&self) -> u64 {
        self.entries.iter().map(|e| e.records).sum()
    }

    /// Group the covered partitions by stream.
    pub fn by_stream(&self) -> FxHashMap<StreamKey, Vec<PartitionKey>> {
        let mut grouped: FxHashMap<StreamKey, Vec<PartitionKey>> = FxHashMap::default();
        for entry in &self.entries {
            grouped
                .entry(entry.stream.clone())
                .or_default()
                .push(entry.partition.clone());
        }
        grouped
    }

    /// Required record count per stream.
    pub fn records_by_stream(&self) -> FxHashMap<StreamKey, u64> {
        let mut grouped: FxHashMap<StreamKey, u64> = FxHashMap::default();
        for entry in &self.entries {
            *grouped.entry(entry.stream.clone()).or_default() += entry.records;
        }
        grouped
    }
}

/// Everything the input collaborator can hand to the parse stage.
#[derive(Clone, Debug, PartialEq, strum_macros::Display)]
pub enum SourceItem {
    Record(ChangeRecord),
    Checkpoint(Checkpoint),
    EndOfStream,
}

/// A released checkpoint, carrying the committed stats and the complete
/// additional-metrics snapshot for the window it covers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCheckpoint {
    checkpoint: Checkpoint,
    stats: EmissionStats,
    metrics: IndexMap<String, f64>,
    released_at: DateTime<Utc>,
}

impl EnrichedCheckpoint {
    pub fn new(
        checkpoint: Checkpoint,
        stats: EmissionStats,
        metrics: IndexMap<String, f64>,
        released_at: DateTime<Utc>,
    ) -> Self {
        Self {
            checkpoint,
            stats,
            metrics,
            released_at,
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn stats(&self) -> EmissionStats {
        self.stats
    }

    pub fn metrics(&self) -> &IndexMap<String, f64> {
        &self.metrics
    }

    pub fn released_at(&self) -> DateTime<Utc> {
        self.released_at
    }
}
