// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed item store.
//!
//! Several coordinator processes can share one database file: every write
//! is a compare-and-swap on the `rev` column inside a transaction, so the
//! optimistic-concurrency contract holds across processes.
//!
//! # Schema
//!
//! ```text
//! items           id PK, rev, generation, item_type, target_key,
//!                 dirty, locked, dirty_at, updated_at, body (JSON)
//! item_conflicts  (id, rev) PK, body
//! item_changes    seq AUTOINCREMENT, id UNIQUE   -- latest change per id
//! ```
//!
//! The workflow columns are derived from the JSON body on every write so the
//! views can be served by partial indexes ([`ItemStore::ensure_views()`]).
//! Timestamps are stored as fixed-width RFC 3339 strings with millisecond
//! precision, which sort chronologically.
//!
//! # Change feed
//!
//! Subscribers poll `item_changes` every `poll_interval` and are woken
//! immediately by writes made through the same store handle.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{make_rev, rev_generation, BoxFuture, BulkSaveResult, ItemChange, ItemStore, View};
use crate::db::{self, execute_with_retry};
use crate::error::{CoordinatorError, Result};
use crate::feed::{FeedSink, FeedSubscription};
use crate::item::{Item, ItemType};
use crate::metrics;

const FEED_PAGE_SIZE: i64 = 500;

/// Columns stored next to the JSON body.
struct Row {
    item_type: &'static str,
    target_key: Option<String>,
    dirty: bool,
    locked: bool,
    dirty_at: Option<String>,
    updated_at: Option<String>,
    body: String,
}

impl Row {
    fn from_item(item: &Item) -> Result<Self> {
        Ok(Self {
            item_type: item.item_type.as_str(),
            target_key: item.target_key(),
            dirty: item.is_dirty(),
            locked: item.is_locked(),
            dirty_at: item.dirty_at.map(format_ts),
            updated_at: item.updated_at.map(format_ts),
            body: item.to_json()?,
        })
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode(id: String, rev: String, body: &str, conflicts: Option<String>) -> Result<Item> {
    let conflicts = conflicts
        .map(|c| c.split(',').filter(|r| !r.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    let mut item = Item::from_json(body, Some(rev), conflicts)?;
    item.id = id;
    Ok(item)
}

/// Decode a row read by a view or the feed. An undecodable document is
/// skipped so one bad row cannot stall every other item of its type.
fn decode_or_skip(id: String, rev: String, body: &str, conflicts: Option<String>) -> Option<Item> {
    match decode(id.clone(), rev, body, conflicts) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!(id = %id, error = %e, "Skipping undecodable item document");
            metrics::record_error("item_store", "decode");
            None
        }
    }
}

const SELECT_ITEM: &str = r#"
    SELECT id, rev, body,
        (SELECT group_concat(c.rev, ',') FROM item_conflicts c WHERE c.id = items.id) AS conflicts
    FROM items
"#;

async fn record_change(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM item_changes WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO item_changes (id) VALUES (?)")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert a new document. `None` when the id is taken.
async fn try_create(conn: &mut SqliteConnection, item: &Item, row: &Row) -> sqlx::Result<Option<String>> {
    let rev = make_rev(1, item);
    let result = sqlx::query(
        r#"
        INSERT INTO items (id, rev, generation, item_type, target_key, dirty, locked, dirty_at, updated_at, body)
        VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&item.id)
    .bind(&rev)
    .bind(row.item_type)
    .bind(&row.target_key)
    .bind(row.dirty)
    .bind(row.locked)
    .bind(&row.dirty_at)
    .bind(&row.updated_at)
    .bind(&row.body)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    record_change(conn, &item.id).await?;
    Ok(Some(rev))
}

/// Compare-and-swap on `rev`. `None` when the revision is stale or missing.
async fn try_update(conn: &mut SqliteConnection, item: &Item, row: &Row) -> sqlx::Result<Option<String>> {
    let Some(expected) = item.rev.as_deref() else {
        return Ok(None);
    };
    let generation = rev_generation(expected) + 1;
    let rev = make_rev(generation, item);
    let result = sqlx::query(
        r#"
        UPDATE items SET
            rev = ?, generation = ?, item_type = ?, target_key = ?,
            dirty = ?, locked = ?, dirty_at = ?, updated_at = ?, body = ?
        WHERE id = ? AND rev = ?
        "#,
    )
    .bind(&rev)
    .bind(generation as i64)
    .bind(row.item_type)
    .bind(&row.target_key)
    .bind(row.dirty)
    .bind(row.locked)
    .bind(&row.dirty_at)
    .bind(&row.updated_at)
    .bind(&row.body)
    .bind(&item.id)
    .bind(expected)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    record_change(conn, &item.id).await?;
    Ok(Some(rev))
}

enum DestroyOutcome {
    Destroyed,
    Stale,
    Missing,
}

async fn try_destroy(conn: &mut SqliteConnection, id: &str, rev: &str) -> sqlx::Result<DestroyOutcome> {
    let removed = sqlx::query("DELETE FROM item_conflicts WHERE id = ? AND rev = ?")
        .bind(id)
        .bind(rev)
        .execute(&mut *conn)
        .await?;
    if removed.rows_affected() > 0 {
        record_change(conn, id).await?;
        return Ok(DestroyOutcome::Destroyed);
    }

    let current: Option<String> = sqlx::query_scalar("SELECT rev FROM items WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match current {
        None => return Ok(DestroyOutcome::Missing),
        Some(current) if current != rev => return Ok(DestroyOutcome::Stale),
        Some(_) => {}
    }

    // Winner removed: the highest sibling takes its place
    let sibling: Option<(String, String)> =
        sqlx::query_as("SELECT rev, body FROM item_conflicts WHERE id = ? ORDER BY rev DESC LIMIT 1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    match sibling {
        Some((sibling_rev, body)) => {
            let promoted = Item::from_json(&body, None, Vec::new()).ok();
            let (target_key, dirty, locked, dirty_at, updated_at) = match &promoted {
                Some(item) => (
                    item.target_key(),
                    item.is_dirty(),
                    item.is_locked(),
                    item.dirty_at.map(format_ts),
                    item.updated_at.map(format_ts),
                ),
                None => (None, true, false, None, None),
            };
            sqlx::query(
                r#"
                UPDATE items SET rev = ?, generation = ?, target_key = ?, dirty = ?, locked = ?,
                    dirty_at = ?, updated_at = ?, body = ?
                WHERE id = ?
                "#,
            )
            .bind(&sibling_rev)
            .bind(rev_generation(&sibling_rev) as i64)
            .bind(target_key)
            .bind(dirty)
            .bind(locked)
            .bind(dirty_at)
            .bind(updated_at)
            .bind(&body)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            sqlx::query("DELETE FROM item_conflicts WHERE id = ? AND rev = ?")
                .bind(id)
                .bind(&sibling_rev)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM items WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }
    }
    record_change(conn, id).await?;
    Ok(DestroyOutcome::Destroyed)
}

/// SQLite implementation of [`ItemStore`].
#[derive(Clone)]
pub struct SqliteItemStore {
    pool: SqlitePool,
    head: Arc<watch::Sender<u64>>,
    poll_interval: Duration,
    path: String,
}

impl SqliteItemStore {
    /// Open (or create) the item store at `path`.
    pub async fn open(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing item store");

        let pool = db::connect(path.as_ref(), 4).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                rev TEXT NOT NULL,
                generation INTEGER NOT NULL,
                item_type TEXT NOT NULL,
                target_key TEXT,
                dirty INTEGER NOT NULL,
                locked INTEGER NOT NULL,
                dirty_at TEXT,
                updated_at TEXT,
                body TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_conflicts (
                id TEXT NOT NULL,
                rev TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (id, rev)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS item_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let store = Self {
            pool,
            head: Arc::new(watch::channel(0).0),
            poll_interval,
            path: path_str,
        };
        let seq = store.current_seq().await?;
        store.head.send_replace(seq);
        Ok(store)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn current_seq(&self) -> Result<u64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM item_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq as u64)
    }

    async fn notify(&self) {
        match self.current_seq().await {
            Ok(seq) => {
                self.head.send_replace(seq);
            }
            Err(e) => debug!(error = %e, "Could not read change head"),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Item>> {
        let sql = format!("{} WHERE id = ?", SELECT_ITEM);
        let row: Option<(String, String, String, Option<String>)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(id, rev, body, conflicts)| decode(id, rev, &body, conflicts))
            .transpose()
    }

    /// Store a conflicting sibling revision next to the current winner.
    ///
    /// This is what replicating a concurrent write from another node looks
    /// like. Returns the sibling's revision.
    pub async fn insert_conflict(&self, id: &str, sibling: &Item) -> Result<String> {
        let Some(winner) = self.fetch(id).await? else {
            return Err(CoordinatorError::not_found(id));
        };
        let mut sibling = sibling.clone();
        sibling.id = id.to_string();
        let generation = winner.rev.as_deref().map(rev_generation).unwrap_or(1);
        let mut rev = make_rev(generation, &sibling);
        if Some(rev.as_str()) == winner.rev.as_deref() {
            rev.push('x');
        }
        let body = sibling.to_json()?;

        let pool = &self.pool;
        let rev_ref = &rev;
        let body_ref = &body;
        execute_with_retry("item_insert_conflict", || async move {
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT OR REPLACE INTO item_conflicts (id, rev, body) VALUES (?, ?, ?)")
                .bind(id)
                .bind(rev_ref)
                .bind(body_ref)
                .execute(&mut *tx)
                .await?;
            record_change(&mut tx, id).await?;
            tx.commit().await
        })
        .await?;

        self.notify().await;
        Ok(rev)
    }

    /// Close the connection pool, checkpointing the WAL first.
    pub async fn close(&self) {
        if let Err(e) = db::wal_checkpoint(&self.pool).await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Item store closed");
    }

    fn view_filter(view: &View) -> (&'static str, Option<String>) {
        match view {
            View::DirtyAndUnlocked(_) => ("dirty = 1 AND locked = 0 ORDER BY updated_at, id", None),
            View::Locked(_) => ("locked = 1 ORDER BY updated_at, id", None),
            View::Dirty(_) => ("dirty = 1 ORDER BY updated_at, id", None),
            View::TargetKeys { keys, .. } => (
                "target_key IN (SELECT value FROM json_each(?)) ORDER BY id",
                Some(serde_json::Value::from(keys.clone()).to_string()),
            ),
            View::SoilableBefore { until, .. } => (
                "dirty_at IS NOT NULL AND dirty_at <= ? ORDER BY dirty_at, id",
                Some(format_ts(*until)),
            ),
            View::EarliestDirtyAt(_) => ("dirty_at IS NOT NULL ORDER BY dirty_at, id LIMIT 1", None),
        }
    }
}

impl ItemStore for SqliteItemStore {
    fn ensure_views(&self, item_type: ItemType) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let t = item_type.as_str();
            let statements = [
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_dirty_unlocked ON items(updated_at) \
                     WHERE item_type = '{t}' AND dirty = 1 AND locked = 0"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_locked ON items(updated_at) \
                     WHERE item_type = '{t}' AND locked = 1"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_dirty ON items(updated_at) \
                     WHERE item_type = '{t}' AND dirty = 1"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_target_key ON items(target_key) \
                     WHERE item_type = '{t}'"
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS idx_{t}_dirty_at ON items(dirty_at) \
                     WHERE item_type = '{t}' AND dirty_at IS NOT NULL"
                ),
            ];
            for sql in &statements {
                sqlx::query(sql).execute(&self.pool).await?;
            }
            debug!(item_type = %item_type, "Item views ensured");
            Ok(())
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Option<Item>> {
        let id = id.to_string();
        Box::pin(async move { self.fetch(&id).await })
    }

    fn create(&self, item: &Item) -> BoxFuture<'_, Item> {
        let mut item = item.clone();
        Box::pin(async move {
            if item.id.is_empty() {
                item.id = sqlx::query_scalar("SELECT lower(hex(randomblob(16)))")
                    .fetch_one(&self.pool)
                    .await?;
            }
            let row = Row::from_item(&item)?;
            let pool = &self.pool;
            let (item_ref, row_ref) = (&item, &row);
            let rev = execute_with_retry("item_create", || async move {
                let mut tx = pool.begin().await?;
                let rev = try_create(&mut tx, item_ref, row_ref).await?;
                tx.commit().await?;
                Ok(rev)
            })
            .await?;

            let Some(rev) = rev else {
                return Err(CoordinatorError::conflict(&item.id));
            };
            self.notify().await;
            item.rev = Some(rev);
            item.conflicts.clear();
            Ok(item)
        })
    }

    fn update(&self, item: &Item) -> BoxFuture<'_, Item> {
        let mut item = item.clone();
        Box::pin(async move {
            let row = Row::from_item(&item)?;
            let pool = &self.pool;
            let (item_ref, row_ref) = (&item, &row);
            let rev = execute_with_retry("item_update", || async move {
                let mut tx = pool.begin().await?;
                let rev = try_update(&mut tx, item_ref, row_ref).await?;
                tx.commit().await?;
                Ok(rev)
            })
            .await?;

            let Some(rev) = rev else {
                return Err(CoordinatorError::conflict(&item.id));
            };
            self.notify().await;
            item.rev = Some(rev);
            Ok(item)
        })
    }

    fn destroy(&self, id: &str, rev: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        let rev = rev.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let (id_ref, rev_ref) = (&id, &rev);
            let outcome = execute_with_retry("item_destroy", || async move {
                let mut tx = pool.begin().await?;
                let outcome = try_destroy(&mut tx, id_ref, rev_ref).await?;
                tx.commit().await?;
                Ok(outcome)
            })
            .await?;

            match outcome {
                DestroyOutcome::Destroyed => {
                    self.notify().await;
                    Ok(())
                }
                DestroyOutcome::Stale => Err(CoordinatorError::conflict(&id)),
                DestroyOutcome::Missing => Err(CoordinatorError::not_found(&id)),
            }
        })
    }

    fn bulk_save(&self, items: Vec<Item>) -> BoxFuture<'_, Vec<BulkSaveResult>> {
        Box::pin(async move {
            let mut prepared = Vec::with_capacity(items.len());
            let mut results: Vec<Option<BulkSaveResult>> = Vec::with_capacity(items.len());
            for mut item in items {
                if item.id.is_empty() {
                    item.id = sqlx::query_scalar("SELECT lower(hex(randomblob(16)))")
                        .fetch_one(&self.pool)
                        .await?;
                }
                match Row::from_item(&item) {
                    Ok(row) => {
                        prepared.push((item, row));
                        results.push(None);
                    }
                    Err(e) => {
                        results.push(Some(BulkSaveResult::Failed {
                            id: item.id.clone(),
                            message: e.to_string(),
                        }));
                    }
                }
            }

            let pool = &self.pool;
            let prepared_ref = &prepared;
            let revs = execute_with_retry("item_bulk_save", || async move {
                let mut tx = pool.begin().await?;
                let mut revs = Vec::with_capacity(prepared_ref.len());
                for (item, row) in prepared_ref {
                    let rev = if item.rev.is_none() {
                        try_create(&mut tx, item, row).await?
                    } else {
                        try_update(&mut tx, item, row).await?
                    };
                    revs.push(rev);
                }
                tx.commit().await?;
                Ok(revs)
            })
            .await?;

            let mut outcomes = prepared.into_iter().zip(revs).map(|((item, _), rev)| match rev {
                Some(rev) => BulkSaveResult::Saved { id: item.id, rev },
                None => BulkSaveResult::Conflict { id: item.id },
            });
            let merged: Vec<BulkSaveResult> = results
                .into_iter()
                .filter_map(|slot| slot.or_else(|| outcomes.next()))
                .collect();

            self.notify().await;
            Ok(merged)
        })
    }

    fn query(&self, view: View) -> BoxFuture<'_, Vec<Item>> {
        Box::pin(async move {
            let (filter, extra) = Self::view_filter(&view);
            let sql = format!("{} WHERE item_type = ? AND {}", SELECT_ITEM, filter);
            let mut query = sqlx::query_as::<sqlx::Sqlite, (String, String, String, Option<String>)>(&sql)
                .bind(view.item_type().as_str());
            if let Some(extra) = extra {
                query = query.bind(extra);
            }
            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows
                .into_iter()
                .filter_map(|(id, rev, body, conflicts)| decode_or_skip(id, rev, &body, conflicts))
                .collect())
        })
    }

    fn last_seq(&self) -> BoxFuture<'_, u64> {
        Box::pin(self.current_seq())
    }

    fn changes(&self, item_type: ItemType, since: u64) -> FeedSubscription<ItemChange> {
        let pool = self.pool.clone();
        let head_tx = Arc::clone(&self.head);
        let mut head = head_tx.subscribe();
        let poll_interval = self.poll_interval;

        FeedSubscription::spawn(move |mut sink: FeedSink<ItemChange>| async move {
            let _head_tx = head_tx;
            let sql = format!(
                r#"
                SELECT ch.seq, items.id, items.rev, items.body,
                    (SELECT group_concat(c.rev, ',') FROM item_conflicts c WHERE c.id = items.id)
                FROM item_changes ch
                JOIN items ON items.id = ch.id
                WHERE ch.seq > ? AND items.item_type = '{}'
                    AND (items.dirty = 1 OR EXISTS (SELECT 1 FROM item_conflicts c WHERE c.id = items.id))
                ORDER BY ch.seq
                LIMIT {}
                "#,
                item_type.as_str(),
                FEED_PAGE_SIZE
            );
            let mut cursor = since;

            loop {
                head.borrow_and_update();
                let rows: Vec<(i64, String, String, String, Option<String>)> =
                    match sqlx::query_as(&sql).bind(cursor as i64).fetch_all(&pool).await {
                        Ok(rows) => rows,
                        Err(e) => {
                            let _ = sink.send(Err(e.into())).await;
                            return;
                        }
                    };
                let full_page = rows.len() as i64 == FEED_PAGE_SIZE;

                for (seq, id, rev, body, conflicts) in rows {
                    cursor = seq as u64;
                    let Some(item) = decode_or_skip(id, rev, &body, conflicts) else {
                        continue;
                    };
                    let entry = ItemChange {
                        seq: seq as u64,
                        item,
                    };
                    if !sink.send(Ok(entry)).await {
                        return;
                    }
                }
                if full_page {
                    continue;
                }

                tokio::select! {
                    _ = head.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = sink.cancelled() => return,
                }
            }
        })
    }
}
