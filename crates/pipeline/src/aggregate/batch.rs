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

use crate::message::ChangeRecord;
use sluice_stats::{PartitionHistogram, StreamKey};
use std::time::Instant;

/// Why an aggregate was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum CloseReason {
    RecordLimit,
    ByteLimit,
    Stale,
    GlobalByteBudget,
    EndOfStream,
}

/// A mutable accumulation buffer holding records bound for one destination
/// stream. Owned by a single aggregation worker; closing it and opening a
/// successor is atomic from the perspective of subsequent accumulation.
#[derive(Debug, Clone)]
pub struct Aggregate {
    stream: StreamKey,
    /// Monotonic per-store index; the identity used to flush each closed
    /// aggregate exactly once.
    index: u64,
    records: Vec<ChangeRecord>,
    estimated_bytes: u64,
    partition_counts: PartitionHistogram,
    partition_bytes: PartitionHistogram,
    created_at: Instant,
    last_write_at: Instant,
    /// Whether the buffered content has been durably written out of
    /// memory.
    persisted: bool,
    close_reason: Option<CloseReason>,
}

impl Aggregate {
    pub(crate) fn new(stream: StreamKey, index: u64) -> Self {
        let now = Instant::now();
        Self {
            stream,
            index,
            records: Vec::new(),
            estimated_bytes: 0,
            partition_counts: PartitionHistogram::new(),
            partition_bytes: PartitionHistogram::new(),
            created_at: now,
            last_write_at: now,
            persisted: false,
            close_reason: None,
        }
    }

    pub(crate) fn push(&mut self, record: ChangeRecord, estimated_size: u64) {
        self.partition_counts.record(record.partition().clone(), 1);
        self.partition_bytes
            .record(record.partition().clone(), estimated_size);
        self.estimated_bytes = self.estimated_bytes.saturating_add(estimated_size);
        self.last_write_at = Instant::now();
        self.records.push(record);
    }

    pub(crate) fn close(&mut self, reason: CloseReason) {
        self.close_reason = Some(reason);
    }

    pub fn stream(&self) -> &StreamKey {
        &self.stream
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    pub fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bytes
    }

    /// Records contributed per partition lane.
    pub fn partition_counts(&self) -> &PartitionHistogram {
        &self.partition_counts
    }

    /// Estimated bytes contributed per partition lane.
    pub fn partition_bytes(&self) -> &PartitionHistogram {
        &self.partition_bytes
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_write_at(&self) -> Instant {
        self.last_write_at
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records
    }
}
