// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-listener items: follow one source database's change feed.
//!
//! Each cycle reads one page of changes after the stored `last_seq`, hands
//! them to the dispatcher and stores the new position on the item. The
//! unlock write persists it, so a crash before unlocking replays the page
//! (dispatch must be idempotent). While the source reports more pending
//! changes the item is left dirty and comes straight back.
//!
//! ```text
//! fetch(db, last_seq) ──▶ dispatch(changes) ──▶ item.last_seq = page.last_seq
//!                                                  │
//!                                   pending > 0 ───┴──▶ leave dirty
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::engine::ItemAction;
use crate::item::{Item, ItemType};
use crate::store::BoxFuture;

/// Changes requested per cycle.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// One change read from a source database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChange {
    pub seq: String,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// A page of source changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesPage {
    pub changes: Vec<SourceChange>,
    /// Position after the last change in this page.
    pub last_seq: String,
    /// Changes still waiting after this page.
    pub pending: u64,
}

/// Reads a source database's change feed.
///
/// Fails with `TargetNotFound` when the database no longer exists.
pub trait SourceChanges: Send + Sync + 'static {
    fn fetch<'a>(&'a self, db_name: &'a str, since: Option<&'a str>, limit: usize) -> BoxFuture<'a, ChangesPage>;
}

/// Receives the changes a listener reads.
pub trait ChangeDispatcher: Send + Sync + 'static {
    fn dispatch<'a>(&'a self, db_name: &'a str, changes: Vec<SourceChange>) -> BoxFuture<'a, ()>;
}

/// Process action for change-listener items.
pub struct ChangeListenerAction {
    source: Arc<dyn SourceChanges>,
    dispatcher: Arc<dyn ChangeDispatcher>,
    page_size: usize,
}

impl ChangeListenerAction {
    pub fn new(source: Arc<dyn SourceChanges>, dispatcher: Arc<dyn ChangeDispatcher>) -> Self {
        Self {
            source,
            dispatcher,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl ItemAction for ChangeListenerAction {
    fn item_type(&self) -> ItemType {
        ItemType::ChangeListener
    }

    fn process<'a>(&'a self, item: &'a mut Item) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let state = item.change_listener_state()?;
            let page = self
                .source
                .fetch(&state.db_name, state.last_seq.as_deref(), self.page_size)
                .await?;

            let count = page.changes.len();
            if count > 0 {
                self.dispatcher.dispatch(&state.db_name, page.changes).await?;
            }
            item.set_payload("last_seq", Value::String(page.last_seq.clone()));

            debug!(
                db_name = %state.db_name,
                count,
                last_seq = %page.last_seq,
                pending = page.pending,
                "Dispatched source changes"
            );
            Ok(page.pending > 0)
        })
    }

    fn synthesize(&self, target_key: &str) -> Option<Item> {
        Some(Item::change_listener(target_key))
    }
}
