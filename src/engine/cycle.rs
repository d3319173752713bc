// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The per-item cycle: lock → process → unlock/clean.
//!
//! ```text
//! item ──conflicts?──▶ resolve_conflicts ──▶ re-read
//!   │
//!   ├─ not dirty+unlocked ──▶ Skipped
//!   │
//!   lock (conditional update)
//!   ├─ Conflict ──▶ Skipped (another worker has it)
//!   │
//!   process
//!   ├─ Ok(leave_dirty) ──▶ unlock_and_clean ──Conflict──▶ upsert unlock, keep dirty
//!   ├─ TargetNotFound ──▶ stale? destroy : mark possibly_deleted_at + redirty
//!   └─ Err ──▶ upsert unlock + redirty
//! ```
//!
//! Processing failures are always returned to the caller, also when the
//! item was destroyed.
//!
//! Every write is an optimistic-concurrency write. Nothing here assumes the
//! lock value itself excludes other workers; the revision check does.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::types::{ItemAction, ProcessOutcome};
use crate::dirtying::{BulkDirtier, SoilScheduler};
use crate::error::{CoordinatorError, Result};
use crate::item::{Item, ItemType};
use crate::metrics;
use crate::report::{ErrorReport, ErrorReporter};
use crate::resilience::Bulkhead;
use crate::store::{upsert, ItemStore};

/// When an upserting unlock makes the item dirty again.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Redirty {
    Now,
    At(DateTime<Utc>),
}

/// Shared state of one engine, used by the feed, sweep and timer tasks.
pub(crate) struct EngineCore {
    pub(crate) store: Arc<dyn ItemStore>,
    pub(crate) action: Arc<dyn ItemAction>,
    pub(crate) item_type: ItemType,
    pub(crate) component: String,
    pub(crate) bulkhead: Bulkhead,
    pub(crate) soil: SoilScheduler,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
    pub(crate) stall_timeout: Duration,
    pub(crate) assume_deleted_after: Duration,
    pub(crate) retry_delay: Option<Duration>,
}

impl EngineCore {
    pub(crate) fn type_name(&self) -> &'static str {
        self.item_type.as_str()
    }

    /// A dirtier sharing this engine's store and soil timer.
    pub(crate) fn dirtier(&self) -> BulkDirtier {
        let dirtier = BulkDirtier::new(self.store.clone(), self.item_type, self.soil.clone());
        let action = self.action.clone();
        dirtier.with_synthesizer(Arc::new(move |key: &str| action.synthesize(key)))
    }

    /// Run one cycle and report a failure instead of returning it.
    ///
    /// Used by the sweep and the feed loop, which must keep going past a
    /// bad item.
    pub(crate) async fn handle(&self, item: Item) {
        let id = item.id.clone();
        if let Err(e) = self.process_item(item).await {
            metrics::record_error(&self.component, error_type(&e));
            self.reporter
                .report(ErrorReport::item(&self.component, id, e.to_string()));
        }
    }

    /// Full cycle for one item as read from a view or the feed.
    pub(crate) async fn process_item(&self, item: Item) -> Result<ProcessOutcome> {
        let item = if item.has_conflicts() {
            self.resolve_conflicts(&item).await?;
            match self.store.get(&item.id).await? {
                Some(latest) => latest,
                None => return Ok(ProcessOutcome::Skipped),
            }
        } else {
            item
        };

        if !item.is_dirty_and_unlocked() {
            return Ok(ProcessOutcome::Skipped);
        }

        // Staleness reference for the deletion heuristic, before our own write
        let read_updated_at = item.updated_at;

        let Some(locked) = self.lock(&item).await? else {
            return Ok(ProcessOutcome::Skipped);
        };

        let started = Instant::now();
        let mut working = locked.clone();
        let result = self.action.process(&mut working).await;

        match result {
            Ok(leave_dirty) => {
                working.possibly_deleted_at = None;
                self.unlock_and_clean(working, leave_dirty).await?;
                let outcome = if leave_dirty {
                    ProcessOutcome::LeftDirty
                } else {
                    ProcessOutcome::Clean
                };
                metrics::record_item_processed(self.type_name(), outcome.as_str(), started.elapsed());
                Ok(outcome)
            }
            Err(e) if e.is_target_not_found() => {
                let now = Utc::now();
                let reference = locked.possibly_deleted_at.or(read_updated_at);
                if self.assume_deleted(reference, now) {
                    match self.destroy_locked(&locked).await {
                        Ok(true) => {
                            info!(
                                item_type = %self.type_name(),
                                id = %locked.id,
                                "Target gone, item destroyed"
                            );
                            metrics::record_item_processed(self.type_name(), "destroyed", started.elapsed());
                            return Err(e);
                        }
                        Ok(false) => {}
                        Err(destroy_err) => {
                            warn!(id = %locked.id, error = %destroy_err, "Failed to destroy item");
                        }
                    }
                }

                let mut marked = locked.clone();
                marked.possibly_deleted_at.get_or_insert(now);
                self.redirty_after_failure(marked).await?;
                metrics::record_item_processed(self.type_name(), "error", started.elapsed());
                Err(e)
            }
            Err(e) => {
                self.redirty_after_failure(locked).await?;
                metrics::record_item_processed(self.type_name(), "error", started.elapsed());
                Err(e)
            }
        }
    }

    /// Take ownership of an item.
    ///
    /// `None` means another worker changed it first; that is not an error.
    pub(crate) async fn lock(&self, item: &Item) -> Result<Option<Item>> {
        let now = Utc::now();
        let mut next = item.clone();
        next.locked_at = Some(now);
        next.touch(now);

        match self.store.update(&next).await {
            Ok(locked) => {
                metrics::record_lock_attempt(self.type_name(), true);
                debug!(item_type = %self.type_name(), id = %item.id, "Locked");
                Ok(Some(locked))
            }
            Err(e) if e.is_conflict() => {
                metrics::record_lock_attempt(self.type_name(), false);
                debug!(item_type = %self.type_name(), id = %item.id, "Lock conflict, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release the lock and, unless `leave_dirty`, mark the item clean.
    ///
    /// A conflict means somebody dirtied the item while we held it. The
    /// processed payload is then written onto the latest revision with the
    /// lock cleared and dirtiness kept.
    pub(crate) async fn unlock_and_clean(&self, mut item: Item, leave_dirty: bool) -> Result<Option<Item>> {
        let now = Utc::now();
        item.locked_at = None;
        item.dirty = Some(leave_dirty);
        if !leave_dirty {
            item.dirty_at = None;
        }
        item.touch(now);

        match self.store.update(&item).await {
            Ok(saved) => Ok(Some(saved)),
            Err(e) if e.is_conflict() => {
                debug!(
                    item_type = %self.type_name(),
                    id = %item.id,
                    "Unlock conflict, item was dirtied concurrently"
                );
                metrics::record_unlock_fallback(self.type_name());
                self.upsert_unlock(&item.id, Some(item.clone()), Redirty::Now).await
            }
            Err(e) => Err(e),
        }
    }

    /// Upserting unlock that always leaves the item dirty.
    ///
    /// With `processed`, its payload replaces the stored payload. Returns
    /// `None` if the item no longer exists (it is not recreated).
    pub(crate) async fn upsert_unlock(
        &self,
        id: &str,
        processed: Option<Item>,
        redirty: Redirty,
    ) -> Result<Option<Item>> {
        upsert(self.store.as_ref(), id, |current| {
            let mut next = current?;
            if let Some(processed) = &processed {
                next.payload = processed.payload.clone();
                next.possibly_deleted_at = processed.possibly_deleted_at;
            }
            let now = Utc::now();
            next.locked_at = None;
            match redirty {
                Redirty::Now => {
                    next.dirty = Some(true);
                    next.dirty_at = None;
                }
                Redirty::At(at) => {
                    next.dirty = Some(false);
                    next.dirty_at = Some(next.dirty_at.map_or(at, |existing| existing.min(at)));
                }
            }
            next.touch(now);
            Some(next)
        })
        .await
    }

    async fn redirty_after_failure(&self, item: Item) -> Result<()> {
        let redirty = match self.retry_delay {
            Some(delay) => match chrono::Duration::from_std(delay) {
                Ok(delay) => Redirty::At(Utc::now() + delay),
                Err(_) => Redirty::Now,
            },
            None => Redirty::Now,
        };
        let id = item.id.clone();
        self.upsert_unlock(&id, Some(item), redirty).await?;
        if let Redirty::At(at) = redirty {
            self.soil.schedule(at);
        }
        Ok(())
    }

    fn assume_deleted(&self, reference: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(reference) = reference else {
            return false;
        };
        match (now - reference).to_std() {
            Ok(age) => age > self.assume_deleted_after,
            Err(_) => false,
        }
    }

    /// Destroy the revision we locked. `false` if it changed meanwhile.
    async fn destroy_locked(&self, locked: &Item) -> Result<bool> {
        let Some(rev) = locked.rev.as_deref() else {
            return Ok(false);
        };
        match self.store.destroy(&locked.id, rev).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() || e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Destroy every conflicting sibling revision of `item`.
    ///
    /// A locked item is first force-unlocked and redirtied: another node may
    /// see different lock state, so the work is redone rather than trusted.
    /// Returns the number of siblings this call removed.
    pub(crate) async fn resolve_conflicts(&self, item: &Item) -> Result<usize> {
        if !item.has_conflicts() {
            return Ok(0);
        }

        if item.is_locked() {
            self.upsert_unlock(&item.id, None, Redirty::Now).await?;
        }

        let mut resolved = 0;
        for rev in &item.conflicts {
            match self.store.destroy(&item.id, rev).await {
                Ok(()) => resolved += 1,
                Err(e) if e.is_conflict() || e.is_not_found() => {
                    debug!(id = %item.id, rev = %rev, "Sibling already resolved elsewhere");
                }
                Err(e) => return Err(e),
            }
        }

        metrics::record_conflicts_resolved(self.type_name(), resolved);
        debug!(
            item_type = %self.type_name(),
            id = %item.id,
            resolved,
            "Resolved conflicting revisions"
        );
        Ok(resolved)
    }
}

fn error_type(e: &CoordinatorError) -> &'static str {
    match e {
        CoordinatorError::Conflict { .. } => "conflict",
        CoordinatorError::TargetNotFound { .. } => "target_not_found",
        CoordinatorError::Action(_) => "action",
        CoordinatorError::Database(_) => "database",
        CoordinatorError::Redis { .. } => "redis",
        _ => "other",
    }
}
