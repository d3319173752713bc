// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for feed positions.
//!
//! The update batcher stores the sequence of the last global update it has
//! fully handled under a fixed key, so a restarted process resumes the
//! database-updates feed instead of replaying it from the beginning.
//!
//! ## Checkpoint Semantics
//!
//! The checkpoint is the **last fully handled** sequence. On restart the
//! feed resumes after it (exclusive read).
//!
//! ```text
//! flush batch ending at seq 1234 → persist checkpoint 1234
//!                                   (crash here = redo batch, idempotent)
//! ```
//!
//! Writes are throttled by the caller, so [`SqliteCheckpointStore::set()`]
//! goes straight to disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::{self, execute_with_retry};
use crate::error::Result;
use crate::store::BoxFuture;

/// Durable key/value storage for feed positions.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Read a checkpoint. `None` on first run.
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>>;

    /// Persist a checkpoint.
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, ()>;
}

/// In-memory checkpoints (lost on restart).
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.values.read().await.get(&key).cloned()) })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, ()> {
        let (key, value) = (key.to_string(), value.to_string());
        Box::pin(async move {
            self.values.write().await.insert(key, value);
            Ok(())
        })
    }
}

/// Checkpoint storage backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    /// Read-through cache
    cache: Arc<RwLock<HashMap<String, String>>>,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open the checkpoint store at the given path.
    ///
    /// Creates the database and table if they don't exist.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing checkpoint store");

        let pool = db::connect(path.as_ref(), 2).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM checkpoints")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (key, value) in rows {
            debug!(key = %key, value = %value, "Loaded checkpoint from disk");
            cache.insert(key, value);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection pool, checkpointing the WAL first.
    pub async fn close(&self) {
        if let Err(e) = db::wal_checkpoint(&self.pool).await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Option<String>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.cache.read().await.get(&key).cloned()) })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, ()> {
        let (key, value) = (key.to_string(), value.to_string());
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let (key_ref, value_ref) = (&key, &value);

            execute_with_retry("checkpoint_set", || async move {
                sqlx::query(
                    r#"
                    INSERT INTO checkpoints (key, value, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(key_ref)
                .bind(value_ref)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;

            debug!(key = %key, value = %value, "Checkpoint saved");
            self.cache.write().await.insert(key, value);
            Ok(())
        })
    }
}
