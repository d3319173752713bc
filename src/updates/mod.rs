// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Global database-updates feed.
//!
//! One notification per write to any database on the server, carrying only
//! the database name and what happened to it. The [`UpdateBatcher`] turns
//! bursts of these into dirtying calls.
//!
//! | Backend | Transport | Use |
//! |---------|-----------|-----|
//! | [`MemoryUpdatesFeed`] | in-process log | tests, single-process embedding |
//! | [`RedisUpdatesFeed`] | Redis stream (`XREAD BLOCK`) | production |
//!
//! Sequences are opaque strings. A subscription started with `since` yields
//! only notifications strictly after it; `None` starts at the current head.
//!
//! [`UpdateBatcher`]: crate::batcher::UpdateBatcher

mod memory;
mod stream;

pub use self::memory::MemoryUpdatesFeed;
pub use self::stream::{compare_stream_ids, RedisUpdatesFeed};

use serde::{Deserialize, Serialize};

use crate::feed::FeedSubscription;

/// What happened to a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Created,
    Updated,
    Deleted,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Created => "created",
            UpdateKind::Updated => "updated",
            UpdateKind::Deleted => "deleted",
        }
    }

    /// Parse a notification type. Unknown types are treated as updates.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => UpdateKind::Created,
            "deleted" => UpdateKind::Deleted,
            _ => UpdateKind::Updated,
        }
    }
}

/// One notification from the global updates feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUpdate {
    /// Feed position, usable as a resume checkpoint.
    pub seq: String,
    pub db_name: String,
    pub kind: UpdateKind,
}

/// A resumable, continuous feed of database updates.
pub trait UpdatesFeed: Send + Sync + 'static {
    /// Subscribe after `since`, or at the current head when `None`.
    fn subscribe(&self, since: Option<String>) -> FeedSubscription<DbUpdate>;
}
