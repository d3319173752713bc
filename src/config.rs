// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the work coordinator.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Every field has a default; durations are humantime strings.
//!
//! # Quick Start
//!
//! ```rust
//! use work_coordinator::config::{CoordinatorConfig, EngineConfig};
//!
//! let config = CoordinatorConfig {
//!     engine: EngineConfig {
//!         concurrency: 8,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.engine.stall_timeout_duration().as_secs(), 600);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CoordinatorConfig
//! ├── engine: EngineConfig           # Lock/process/unlock engine per item type
//! ├── batcher: BatcherConfig         # Global update batching
//! ├── store: StoreConfig             # SQLite item store
//! ├── checkpoint: CheckpointConfig   # SQLite checkpoint store
//! └── updates: UpdatesFeedConfig     # Redis stream of database updates
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! engine:
//!   concurrency: 20
//!   stall_timeout: "10m"
//!   assume_deleted_after: "1h"
//!   retry_delay: "30s"
//!
//! batcher:
//!   batch_size: 100
//!   batch_timeout: "1s"
//!   excluded_databases: ["coordinator"]
//!
//! updates:
//!   redis_url: "redis://localhost:6379"
//!   stream_key: "db_updates"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub batcher: BatcherConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub updates: UpdatesFeedConfig,
}

impl CoordinatorConfig {
    /// Create a config with short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::for_testing(),
            batcher: BatcherConfig::for_testing(),
            store: StoreConfig::default(),
            checkpoint: CheckpointConfig::default(),
            updates: UpdatesFeedConfig::default(),
        }
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineConfig: one process engine per item type
// ═══════════════════════════════════════════════════════════════════════════════

/// Process engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum items processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often the locked view is swept for stalled locks.
    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval: String,

    /// Lock age after which an item is presumed abandoned.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: String,

    /// A target missing for longer than this is assumed deleted.
    #[serde(default = "default_assume_deleted_after")]
    pub assume_deleted_after: String,

    /// Delay before a failed item becomes dirty again.
    /// `None` or a zero duration redirties immediately.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Option<String>,

    /// Change-feed poll interval for polling store backends.
    #[serde(default = "default_feed_poll_interval")]
    pub feed_poll_interval: String,
}

fn default_concurrency() -> usize {
    20
}

fn default_stall_check_interval() -> String {
    "1m".to_string()
}

fn default_stall_timeout() -> String {
    "10m".to_string()
}

fn default_assume_deleted_after() -> String {
    "1h".to_string()
}

fn default_retry_delay() -> Option<String> {
    Some("30s".to_string())
}

fn default_feed_poll_interval() -> String {
    "500ms".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            stall_check_interval: default_stall_check_interval(),
            stall_timeout: default_stall_timeout(),
            assume_deleted_after: default_assume_deleted_after(),
            retry_delay: default_retry_delay(),
            feed_poll_interval: default_feed_poll_interval(),
        }
    }
}

impl EngineConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            concurrency: 4,
            stall_check_interval: "50ms".to_string(),
            stall_timeout: "200ms".to_string(),
            assume_deleted_after: "1h".to_string(),
            retry_delay: None,
            feed_poll_interval: "20ms".to_string(),
        }
    }

    pub fn stall_check_interval_duration(&self) -> Duration {
        parse_duration_or(&self.stall_check_interval, Duration::from_secs(60))
    }

    pub fn stall_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.stall_timeout, Duration::from_secs(600))
    }

    pub fn assume_deleted_after_duration(&self) -> Duration {
        parse_duration_or(&self.assume_deleted_after, Duration::from_secs(3600))
    }

    /// `None` when unset or zero. An unparsable value falls back to 30s.
    pub fn retry_delay_duration(&self) -> Option<Duration> {
        self.retry_delay
            .as_deref()
            .map(|d| parse_duration_or(d, Duration::from_secs(30)))
            .filter(|d| !d.is_zero())
    }

    pub fn feed_poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.feed_poll_interval, Duration::from_millis(500))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BatcherConfig: update batching
// ═══════════════════════════════════════════════════════════════════════════════

/// Update batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Flush once this many distinct databases are touched.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush this long after the first event of a batch.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: String,

    /// Minimum time between checkpoint writes.
    #[serde(default = "default_save_seq_after")]
    pub save_seq_after: String,

    /// Key the checkpoint is stored under.
    #[serde(default = "default_checkpoint_key")]
    pub checkpoint_key: String,

    /// Databases whose updates are ignored. Defaults to the coordinator's
    /// own bookkeeping database.
    #[serde(default = "default_excluded_databases")]
    pub excluded_databases: Vec<String>,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> String {
    "1s".to_string()
}

fn default_save_seq_after() -> String {
    "10s".to_string()
}

/// Name of the database holding the coordinator's own documents.
pub const COORDINATOR_DATABASE: &str = "coordinator";

fn default_excluded_databases() -> Vec<String> {
    vec![COORDINATOR_DATABASE.to_string()]
}

fn default_checkpoint_key() -> String {
    "update_batcher_last_seq".to_string()
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            save_seq_after: default_save_seq_after(),
            checkpoint_key: default_checkpoint_key(),
            excluded_databases: default_excluded_databases(),
        }
    }
}

impl BatcherConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: "50ms".to_string(),
            save_seq_after: "0s".to_string(),
            ..Default::default()
        }
    }

    pub fn batch_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.batch_timeout, Duration::from_secs(1))
    }

    pub fn save_seq_after_duration(&self) -> Duration {
        parse_duration_or(&self.save_seq_after, Duration::from_secs(10))
    }

    pub fn is_excluded(&self, db_name: &str) -> bool {
        self.excluded_databases.iter().any(|d| d == db_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite item store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub sqlite_path: String,
}

fn default_store_path() -> String {
    "coordinator_items.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_store_path(),
        }
    }
}

/// SQLite checkpoint store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub sqlite_path: String,
}

fn default_checkpoint_path() -> String {
    "coordinator_checkpoints.db".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_checkpoint_path(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// UpdatesFeedConfig: Redis stream of database updates
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis stream carrying per-database update notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesFeedConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// XREAD block timeout.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per XREAD call.
    #[serde(default = "default_read_count")]
    pub read_count: usize,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_key() -> String {
    "db_updates".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_read_count() -> usize {
    500
}

impl Default for UpdatesFeedConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            stream_key: default_stream_key(),
            block_timeout: default_block_timeout(),
            read_count: default_read_count(),
        }
    }
}

impl UpdatesFeedConfig {
    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.block_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
