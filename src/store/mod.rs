// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item store integration.
//!
//! Defines what the coordinator needs from the shared document database:
//! revisioned get/update/destroy, a bulk create-or-update call with
//! per-document outcomes, per-type index views and a resumable change feed.
//!
//! # Index views
//!
//! | View | Emits items of type `T` where |
//! |------|-------------------------------|
//! | `DirtyAndUnlocked` | `dirty` absent or true, `locked_at` absent |
//! | `Locked` | `locked_at` present |
//! | `Dirty` | `dirty` absent or true (also the change-feed filter) |
//! | `TargetKeys` | the natural key is one of the given keys |
//! | `SoilableBefore` | `dirty_at` present and not after the given time |
//! | `EarliestDirtyAt` | the single item with the smallest `dirty_at` |
//!
//! # Backends
//!
//! - [`MemoryItemStore`]: in-process, for tests and single-node embedding
//! - [`SqliteItemStore`]: sqlx SQLite with partial indexes per type

mod memory;
mod sqlite;

pub use memory::MemoryItemStore;
pub use sqlite::SqliteItemStore;

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CoordinatorError, Result};
use crate::feed::FeedSubscription;
use crate::item::{Item, ItemType};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Attempts before [`upsert()`] gives up on a hot document.
const MAX_UPSERT_ATTEMPTS: usize = 25;

/// An index query over one item type.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    DirtyAndUnlocked(ItemType),
    Locked(ItemType),
    Dirty(ItemType),
    TargetKeys {
        item_type: ItemType,
        keys: Vec<String>,
    },
    SoilableBefore {
        item_type: ItemType,
        until: DateTime<Utc>,
    },
    EarliestDirtyAt(ItemType),
}

impl View {
    pub fn item_type(&self) -> ItemType {
        match self {
            View::DirtyAndUnlocked(t)
            | View::Locked(t)
            | View::Dirty(t)
            | View::EarliestDirtyAt(t) => *t,
            View::TargetKeys { item_type, .. } | View::SoilableBefore { item_type, .. } => {
                *item_type
            }
        }
    }

    /// In-memory evaluation of the view predicate (ordering not included).
    pub fn matches(&self, item: &Item) -> bool {
        if item.item_type != self.item_type() {
            return false;
        }
        match self {
            View::DirtyAndUnlocked(_) => item.is_dirty_and_unlocked(),
            View::Locked(_) => item.is_locked(),
            View::Dirty(_) => item.is_dirty(),
            View::TargetKeys { keys, .. } => item
                .target_key()
                .map(|k| keys.iter().any(|candidate| candidate == &k))
                .unwrap_or(false),
            View::SoilableBefore { until, .. } => {
                item.dirty_at.map(|at| at <= *until).unwrap_or(false)
            }
            View::EarliestDirtyAt(_) => item.dirty_at.is_some(),
        }
    }
}

/// Per-document outcome of [`ItemStore::bulk_save()`].
#[derive(Debug, Clone, PartialEq)]
pub enum BulkSaveResult {
    Saved { id: String, rev: String },
    Conflict { id: String },
    Failed { id: String, message: String },
}

impl BulkSaveResult {
    pub fn id(&self) -> &str {
        match self {
            BulkSaveResult::Saved { id, .. }
            | BulkSaveResult::Conflict { id }
            | BulkSaveResult::Failed { id, .. } => id,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BulkSaveResult::Conflict { .. })
    }
}

/// One entry of an item change feed.
#[derive(Debug, Clone)]
pub struct ItemChange {
    /// Feed position of this change.
    pub seq: u64,
    /// Current winning revision, with sibling conflicts populated.
    pub item: Item,
}

/// What the coordinator needs from the document database.
///
/// Every write is an optimistic-concurrency write: a stale or missing
/// revision fails with [`CoordinatorError::Conflict`]. Nothing here locks
/// across processes.
pub trait ItemStore: Send + Sync + 'static {
    /// Create the index views for an item type.
    fn ensure_views(&self, item_type: ItemType) -> BoxFuture<'_, ()>;

    /// Fetch the winning revision of an item, with conflicts.
    fn get(&self, id: &str) -> BoxFuture<'_, Option<Item>>;

    /// Create a new item. An empty id is assigned by the store.
    fn create(&self, item: &Item) -> BoxFuture<'_, Item>;

    /// Non-upserting update at `item.rev`.
    fn update(&self, item: &Item) -> BoxFuture<'_, Item>;

    /// Destroy the given revision (winning or conflicting sibling).
    fn destroy(&self, id: &str, rev: &str) -> BoxFuture<'_, ()>;

    /// Create-or-update many items in one call.
    ///
    /// Items without a revision are created. Conflicts are reported
    /// per-document rather than failing the call.
    fn bulk_save(&self, items: Vec<Item>) -> BoxFuture<'_, Vec<BulkSaveResult>>;

    /// Query an index view.
    fn query(&self, view: View) -> BoxFuture<'_, Vec<Item>>;

    /// Current head of the change feed.
    fn last_seq(&self) -> BoxFuture<'_, u64>;

    /// Continuous change feed after `since`, filtered by the `Dirty` view of
    /// `item_type` plus any item carrying conflict revisions.
    fn changes(&self, item_type: ItemType, since: u64) -> FeedSubscription<ItemChange>;
}

/// Revision token `<generation>-<content hash>`.
pub(crate) fn make_rev(generation: u64, item: &Item) -> String {
    let mut hasher = DefaultHasher::new();
    generation.hash(&mut hasher);
    item.id.hash(&mut hasher);
    item.to_json().unwrap_or_default().hash(&mut hasher);
    format!("{}-{:016x}", generation, hasher.finish())
}

/// Generation prefix of a revision token.
pub(crate) fn rev_generation(rev: &str) -> u64 {
    rev.split('-').next().and_then(|g| g.parse().ok()).unwrap_or(0)
}

/// Read-mutate-write loop that retries on conflict.
///
/// `mutate` receives the latest revision (or `None` when the item does not
/// exist) and returns the document to write, or `None` to leave the store
/// untouched. Returns the written item, if any.
pub async fn upsert<S, F>(store: &S, id: &str, mut mutate: F) -> Result<Option<Item>>
where
    S: ItemStore + ?Sized,
    F: FnMut(Option<Item>) -> Option<Item> + Send,
{
    for attempt in 1..=MAX_UPSERT_ATTEMPTS {
        let current = store.get(id).await?;
        let exists = current.is_some();
        let Some(mut next) = mutate(current) else {
            return Ok(None);
        };
        if next.id.is_empty() {
            next.id = id.to_string();
        }

        let result = if exists {
            store.update(&next).await
        } else {
            next.rev = None;
            store.create(&next).await
        };

        match result {
            Ok(saved) => return Ok(Some(saved)),
            Err(e) if e.is_conflict() => {
                debug!(id = %id, attempt, "Upsert conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    Err(CoordinatorError::conflict(id))
}
