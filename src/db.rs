// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared SQLite plumbing for the item store and the checkpoint store.
//!
//! # SQLite Busy Handling
//!
//! Several coordinator processes may share one database file. SQLite returns
//! SQLITE_BUSY/SQLITE_LOCKED when a writer holds the lock past the busy
//! timeout, so every write goes through [`execute_with_retry()`]:
//! - Automatic retry with exponential backoff
//! - Bounded attempts (default 5)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info, warn};

use crate::error::{CoordinatorError, Result};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) a WAL-mode database at `path`.
pub(crate) async fn connect(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let path_str = path.to_string_lossy();
    info!(path = %path_str, "Opening SQLite database");

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
        .map_err(|e| CoordinatorError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(SQLITE_BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Check if an error is a retryable SQLite busy/locked error
pub(crate) fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Run a database operation, retrying on SQLITE_BUSY/SQLITE_LOCKED.
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::sqlite_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Flush the WAL into the main database file.
pub(crate) async fn wal_checkpoint(pool: &SqlitePool) -> Result<()> {
    execute_with_retry("wal_checkpoint", || async {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
    })
    .await?;
    debug!("WAL checkpoint complete");
    Ok(())
}
