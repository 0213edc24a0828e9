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
use sluice_stats::{PartitionKey, StreamKey};

/// Failure to estimate a record's serialized size. Scoped to the offending
/// record: the record is skipped and the aggregate's byte accounting is
/// left untouched.
#[derive(Debug, Clone)]
pub enum EstimationError {
    Serialization {
        stream: StreamKey,
        partition: PartitionKey,
        message: String,
    },
}

impl std::fmt::Display for EstimationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization {
                stream,
                partition,
                message,
            } => write!(
                f,
                "failed to estimate record size for stream {stream} partition {partition}: {message}"
            ),
        }
    }
}

impl std::error::Error for EstimationError {}

/// Pluggable record size estimator used for aggregate byte accounting.
pub trait SizeEstimator: Send + 'static {
    fn estimate(&self, record: &ChangeRecord) -> Result<usize, EstimationError>;
}

/// Estimates a record by the length of its JSON serialization.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSizeEstimator;

impl SizeEstimator for JsonSizeEstimator {
    fn estimate(&self, record: &ChangeRecord) -> Result<usize, EstimationError> {
        serde_json::to_vec(record.payload())
            .map(|encoded| encoded.len())
            .map_err(|err| EstimationError::Serialization {
                stream: record.stream().clone(),
                partition: record.partition().clone(),
                message: err.to_string(),
            })
    }
}
