// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concrete item kinds.
//!
//! Each kind is an [`ItemAction`] that delegates the real work to an
//! external collaborator trait, so the coordinator never talks to a
//! replication endpoint or a source database directly:
//!
//! | Kind | Action | Collaborators |
//! |------|--------|---------------|
//! | replicator | [`ReplicatorAction`] | [`ReplicationClient`] |
//! | change listener | [`ChangeListenerAction`] | [`SourceChanges`], [`ChangeDispatcher`] |
//!
//! Collaborators signal a vanished source with
//! [`CoordinatorError::TargetNotFound`], which drives the engine's deletion
//! heuristic.
//!
//! [`ItemAction`]: crate::engine::ItemAction
//! [`CoordinatorError::TargetNotFound`]: crate::error::CoordinatorError::TargetNotFound

mod change_listener;
mod replicator;

pub use change_listener::{
    ChangeDispatcher, ChangeListenerAction, ChangesPage, SourceChange, SourceChanges,
    DEFAULT_PAGE_SIZE,
};
pub use replicator::{ReplicationClient, ReplicatorAction};
