// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and the per-type capability interface.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ stop()                       │ (sweep done, loops spawned)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!                  stop()           │
//!                                   │ (feed failure)
//!                                   ↓
//!                                Failed
//! ```
//!
//! - **Created**: after `ProcessEngine::new()`. Nothing runs.
//! - **Starting**: views ensured, initial sweep in progress.
//! - **Running**: feed, stall and soil loops active.
//! - **ShuttingDown**: loops cancelled, in-flight items draining.
//! - **Stopped**: every in-flight cycle finished. Safe to drop.
//! - **Failed**: the change feed broke. Loops are stopped; the embedding
//!   process is expected to exit and be restarted by its supervisor.

use crate::item::{Item, ItemType};
use crate::store::BoxFuture;

/// State of a process engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// What one item kind plugs into the generic engine.
pub trait ItemAction: Send + Sync + 'static {
    fn item_type(&self) -> ItemType;

    /// Do the work for a locked item.
    ///
    /// Payload changes made to `item` are persisted by the unlock write.
    /// Returns `true` to leave the item dirty because more work remains.
    /// Fail with [`CoordinatorError::TargetNotFound`] when the item's target
    /// appears to be gone.
    ///
    /// [`CoordinatorError::TargetNotFound`]: crate::error::CoordinatorError::TargetNotFound
    fn process<'a>(&'a self, item: &'a mut Item) -> BoxFuture<'a, bool>;

    /// Build a new item for a target key that has none.
    ///
    /// `None` (the default) means items of this kind are never created by
    /// the dirtying protocol.
    fn synthesize(&self, _target_key: &str) -> Option<Item> {
        None
    }
}

/// How one pass over an item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not dirty-and-unlocked, or another worker won the lock.
    Skipped,
    /// Processed and cleaned.
    Clean,
    /// Processed, more work remains.
    LeftDirty,
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Skipped => "skipped",
            ProcessOutcome::Clean => "clean",
            ProcessOutcome::LeftDirty => "redirty",
        }
    }
}
