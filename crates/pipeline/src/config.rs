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

//! Pipeline and aggregate-publishing configuration with fail-fast
//! validation at construction.

use serde_with::serde_as;
use std::time::Duration;

const NUM_AGGREGATE_WORKERS_DEFAULT: usize = 1;

pub(crate) const fn default_aggregate_workers() -> usize {
    NUM_AGGREGATE_WORKERS_DEFAULT
}

const NUM_FLUSH_WORKERS_DEFAULT: usize = 2;

pub(crate) const fn default_flush_workers() -> usize {
    NUM_FLUSH_WORKERS_DEFAULT
}

pub(crate) const fn default_shards() -> usize {
    1
}

pub(crate) const fn default_buffer_size() -> usize {
    1_000
}

pub(crate) const fn default_sweep_interval() -> Duration {
    Duration::from_millis(500)
}

pub(crate) const fn default_flush_retry_backoff() -> Duration {
    Duration::from_millis(250)
}

#[derive(Debug, Clone)]
pub enum ConfigurationError {
    InvalidRecordLimit,
    InvalidByteLimit,
    InvalidStalenessDeadline,
    InvalidGlobalByteBudget,
    /// A single aggregate could never fit under the global budget.
    GlobalByteBudgetBelowAggregateLimit,
    InvalidBufferedAggregateLimit,
    InvalidWorkerCount,
    InvalidShardCount,
    ShardSourceMismatch { shards: usize, sources: usize },
    InvalidBufferSize,
    InvalidSweepInterval,
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRecordLimit => {
                write!(f, "max_records_per_aggregate must be greater than 0")
            }
            Self::InvalidByteLimit => write!(f, "max_bytes_per_aggregate must be greater than 0"),
            Self::InvalidStalenessDeadline => {
                write!(f, "staleness_deadline must be greater than 0")
            }
            Self::InvalidGlobalByteBudget => {
                write!(f, "max_bytes_all_aggregates must be greater than 0")
            }
            Self::GlobalByteBudgetBelowAggregateLimit => write!(
                f,
                "max_bytes_all_aggregates cannot be smaller than max_bytes_per_aggregate"
            ),
            Self::InvalidBufferedAggregateLimit => {
                write!(f, "max_buffered_aggregates must be greater than 0")
            }
            Self::InvalidWorkerCount => write!(f, "worker counts must be greater than 0"),
            Self::InvalidShardCount => write!(f, "shards must be greater than 0"),
            Self::ShardSourceMismatch { shards, sources } => write!(
                f,
                "configured {shards} shards but {sources} input sources were supplied"
            ),
            Self::InvalidBufferSize => write!(f, "buffer_size must be greater than 0"),
            Self::InvalidSweepInterval => write!(f, "sweep_interval must be greater than 0"),
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Thresholds deciding when an open aggregate is closed and handed to the
/// flush stage.
#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TriggerConfig {
    /// Close an aggregate once it buffered this many records.
    pub max_records_per_aggregate: u64,

    /// Close an aggregate once its estimated size reaches this many bytes.
    pub max_bytes_per_aggregate: u64,

    /// Close an aggregate that has not seen a write for this long, checked
    /// by a periodic sweep so idle streams still flush promptly.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub staleness_deadline: Duration,

    /// Ceiling on the summed estimated size of all open aggregates; going
    /// over it closes the largest open aggregate.
    pub max_bytes_all_aggregates: u64,

    /// Bound on closed-but-not-yet-flushed aggregates. Once reached, the
    /// aggregation stage blocks instead of dropping data.
    pub max_buffered_aggregates: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_records_per_aggregate: 10_000,
            max_bytes_per_aggregate: 16 * 1024 * 1024,
            staleness_deadline: Duration::from_secs(60),
            max_bytes_all_aggregates: 128 * 1024 * 1024,
            max_buffered_aggregates: 8,
        }
    }
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_records_per_aggregate == 0 {
            return Err(ConfigurationError::InvalidRecordLimit);
        }
        if self.max_bytes_per_aggregate == 0 {
            return Err(ConfigurationError::InvalidByteLimit);
        }
        if self.staleness_deadline.is_zero() {
            return Err(ConfigurationError::InvalidStalenessDeadline);
        }
        if self.max_bytes_all_aggregates == 0 {
            return Err(ConfigurationError::InvalidGlobalByteBudget);
        }
        if self.max_bytes_all_aggregates < self.max_bytes_per_aggregate {
            return Err(ConfigurationError::GlobalByteBudgetBelowAggregateLimit);
        }
        if self.max_buffered_aggregates == 0 {
            return Err(ConfigurationError::InvalidBufferedAggregateLimit);
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Number of input shards; each shard gets its own stage chain and
    /// aggregate store.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Capacity of the record and state channels between stages.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Aggregation workers per shard; records are routed to a worker by
    /// stream key so accumulation stays serialized per stream.
    #[serde(default = "default_aggregate_workers")]
    pub aggregate_workers: usize,

    /// Flush workers per shard sharing one closed-aggregate queue.
    #[serde(default = "default_flush_workers")]
    pub flush_workers: usize,

    /// How often the aggregation stage checks open aggregates against the
    /// staleness deadline.
    #[serde(default = "default_sweep_interval")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub sweep_interval: Duration,

    /// Delay between retries of a transiently failing destination write.
    #[serde(default = "default_flush_retry_backoff")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub flush_retry_backoff: Duration,

    /// Extra metric keys carried on every enriched checkpoint in addition
    /// to the built-in flush metrics.
    #[serde(default)]
    pub additional_metrics: Vec<String>,

    pub trigger: TriggerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            buffer_size: default_buffer_size(),
            aggregate_workers: default_aggregate_workers(),
            flush_workers: default_flush_workers(),
            sweep_interval: default_sweep_interval(),
            flush_retry_backoff: default_flush_retry_backoff(),
            additional_metrics: Vec::new(),
            trigger: TriggerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.shards == 0 {
            return Err(ConfigurationError::InvalidShardCount);
        }
        if self.buffer_size == 0 {
            return Err(ConfigurationError::InvalidBufferSize);
        }
        if self.aggregate_workers == 0 || self.flush_workers == 0 {
            return Err(ConfigurationError::InvalidWorkerCount);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigurationError::InvalidSweepInterval);
        }
        self.trigger.validate()
    }
}
