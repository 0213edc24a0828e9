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

//! External collaborator interfaces.
//!
//! The engine does not parse wire formats, talk to warehouses or emit
//! checkpoints to a transport itself; it drives these traits. Implementors
//! live in the surrounding runtime (and in test doubles).

use crate::{
    aggregate::Aggregate,
    message::{Checkpoint, CheckpointCoverage, EnrichedCheckpoint, SourceItem},
};
use sluice_stats::PartitionHistogram;
use std::future::Future;

/// Error surfaced by the input collaborator. Always fatal for the pipeline
/// instance reading from it.
#[derive(Debug, Clone)]
pub struct SourceError {
    message: String,
}

impl SourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "source error: {}", self.message)
    }
}

impl std::error::Error for SourceError {}

/// Pull interface feeding the parse stage.
pub trait RecordSource: Send + 'static {
    fn next(&mut self) -> impl Future<Output = Result<SourceItem, SourceError>> + Send;
}

/// What the destination reports back for one successfully written
/// aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub partition_counts: PartitionHistogram,
    pub partition_bytes: PartitionHistogram,
}

/// Destination write failure. Transient failures leave the aggregate
/// pending and are retried; fatal ones fail the pipeline instance.
#[derive(Debug, Clone)]
pub enum FlushError {
    Transient(String),
    Fatal(String),
}

impl FlushError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient flush error: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal flush error: {msg}"),
        }
    }
}

impl std::error::Error for FlushError {}

/// Destination consumed by the flush stage. Shared by all flush workers.
pub trait DestinationWriter: Send + Sync + 'static {
    fn write(
        &self,
        aggregate: &Aggregate,
    ) -> impl Future<Output = Result<FlushResult, FlushError>> + Send;
}

#[derive(Debug, Clone)]
pub struct SinkError {
    message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpoint sink error: {}", self.message)
    }
}

impl std::error::Error for SinkError {}

/// Output collaborator receiving released checkpoints.
pub trait CheckpointSink: Send + Sync + 'static {
    fn emit(
        &self,
        checkpoint: EnrichedCheckpoint,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Bookkeeping collaborator supplying the set of `(stream, partition) ->
/// record count` contributions active at the instant a checkpoint is
/// observed.
pub trait CoverageProvider: Send + Sync + 'static {
    fn coverage(&self, checkpoint: &Checkpoint) -> CheckpointCoverage;
}
