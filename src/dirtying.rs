// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk dirtying: the hand-off from "something changed" to "an engine will
//! process it".
//!
//! [`Dirtier::dirty_if_clean_or_locked()`] is the only entry point other
//! subsystems use to request work. It is idempotent and safe to call
//! redundantly or concurrently from many processes.
//!
//! # Protocol
//!
//! ```text
//! round:
//!   1. query TargetKeys(pending)           every item for the keys
//!   2. skip dirty+unlocked                 already queued
//!      mark the rest dirty (or dirty_at)   locked ones too, the rev bump
//!                                          forces a retry after unlock
//!      synthesize items for missing keys   deterministic ids
//!   3. bulk_save(all)                      one round trip
//!   4. pending = keys whose write conflicted
//! until pending is empty
//! ```
//!
//! A key only conflicts when another writer touched its item between the
//! query and the bulk write, so the pending set shrinks every round and
//! `K` concurrent writers need at most `K + 1` rounds.
//!
//! # Delayed dirtying
//!
//! With a non-zero `dirty_after`, items get `dirty_at = now + dirty_after`
//! instead of `dirty: true` (an earlier existing `dirty_at` is kept). The
//! [`SoilScheduler`] is then armed so the engine converts them once due.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};
use crate::item::{Item, ItemType};
use crate::metrics;
use crate::store::{BoxFuture, BulkSaveResult, ItemStore, View};

/// Rounds after which a dirtying pass gives up.
///
/// Only reachable when writers keep touching the same items indefinitely.
const MAX_DIRTY_ROUNDS: usize = 100;

/// Builds a fresh item for a target key that has none.
pub type Synthesizer = Arc<dyn Fn(&str) -> Option<Item> + Send + Sync>;

/// Outcome of one dirtying pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyReport {
    /// Bulk-write rounds, including conflict retries.
    pub rounds: usize,
    /// Existing items marked dirty (or delayed).
    pub dirtied: usize,
    /// Items synthesized for missing keys.
    pub created: usize,
    /// Writes the store rejected for reasons other than a conflict.
    pub failed: usize,
}

/// Marks items dirty so a process engine picks them up.
pub trait Dirtier: Send + Sync + 'static {
    /// Mark every item for `keys` dirty, creating missing ones when the item
    /// kind supports it. With `dirty_after`, mark them dirty only once that
    /// much time has passed.
    fn dirty_if_clean_or_locked(
        &self,
        keys: Vec<String>,
        dirty_after: Option<Duration>,
    ) -> BoxFuture<'_, DirtyReport>;
}

/// Earliest pending `dirty_at` the engine should wake up for.
///
/// An earlier time always replaces a later one, never the other way round.
#[derive(Debug, Clone)]
pub struct SoilScheduler {
    tx: Arc<watch::Sender<Option<DateTime<Utc>>>>,
}

impl Default for SoilScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SoilScheduler {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Arm the timer for `at` unless it already fires earlier.
    ///
    /// Returns `true` if the wake-up time moved.
    pub fn schedule(&self, at: DateTime<Utc>) -> bool {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if *existing <= at => false,
            _ => {
                *current = Some(at);
                true
            }
        })
    }

    /// Disarm after `fired` went off, unless something earlier or later was
    /// scheduled in the meantime.
    pub fn clear_if(&self, fired: DateTime<Utc>) {
        self.tx.send_if_modified(|current| {
            if *current == Some(fired) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Current wake-up time.
    pub fn next(&self) -> Option<DateTime<Utc>> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.tx.subscribe()
    }
}

/// The bulk dirtying protocol for one item type.
#[derive(Clone)]
pub struct BulkDirtier {
    store: Arc<dyn ItemStore>,
    item_type: ItemType,
    synthesize: Option<Synthesizer>,
    soil: SoilScheduler,
}

impl BulkDirtier {
    pub fn new(store: Arc<dyn ItemStore>, item_type: ItemType, soil: SoilScheduler) -> Self {
        Self {
            store,
            item_type,
            synthesize: None,
            soil,
        }
    }

    /// Create items for keys that have none.
    pub fn with_synthesizer(mut self, synthesize: Synthesizer) -> Self {
        self.synthesize = Some(synthesize);
        self
    }

    pub fn item_type(&self) -> ItemType {
        self.item_type
    }

    pub fn soil_scheduler(&self) -> &SoilScheduler {
        &self.soil
    }

    /// Run the protocol until no key conflicts.
    pub async fn run(&self, keys: Vec<String>, dirty_after: Option<Duration>) -> Result<DirtyReport> {
        let type_name = self.item_type.as_str();
        let mut pending: BTreeSet<String> = keys.into_iter().filter(|k| !k.is_empty()).collect();
        let mut report = DirtyReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let delay = match dirty_after.filter(|d| !d.is_zero()) {
            Some(d) => Some(
                chrono::Duration::from_std(d)
                    .map_err(|e| CoordinatorError::Config(format!("dirty_after out of range: {}", e)))?,
            ),
            None => None,
        };
        let mut earliest_delayed: Option<DateTime<Utc>> = None;

        while !pending.is_empty() {
            if report.rounds >= MAX_DIRTY_ROUNDS {
                warn!(
                    item_type = %type_name,
                    remaining = pending.len(),
                    rounds = report.rounds,
                    "Dirtying did not converge"
                );
                return Err(CoordinatorError::conflict(
                    pending.iter().next().cloned().unwrap_or_default(),
                ));
            }
            report.rounds += 1;

            let now = Utc::now();
            let mark_at = delay.map(|d| now + d);
            let existing = self
                .store
                .query(View::TargetKeys {
                    item_type: self.item_type,
                    keys: pending.iter().cloned().collect(),
                })
                .await?;

            let mut key_of: HashMap<String, String> = HashMap::new();
            let mut found: BTreeSet<String> = BTreeSet::new();
            let mut writes = Vec::new();
            let mut marked = 0usize;

            for mut item in existing {
                let Some(key) = item.target_key() else {
                    continue;
                };
                found.insert(key.clone());
                if item.is_dirty_and_unlocked() {
                    continue;
                }

                match mark_at {
                    Some(at) => {
                        let at = item.dirty_at.map_or(at, |existing| existing.min(at));
                        item.dirty_at = Some(at);
                        earliest_delayed = Some(earliest_delayed.map_or(at, |e| e.min(at)));
                    }
                    None => {
                        item.dirty = Some(true);
                        item.dirty_at = None;
                    }
                }
                item.touch(now);
                key_of.insert(item.id.clone(), key);
                writes.push(item);
                marked += 1;
            }

            let mut synthesized = 0usize;
            if let Some(synthesize) = &self.synthesize {
                for key in pending.iter().filter(|k| !found.contains(*k)) {
                    let Some(mut item) = synthesize(key) else {
                        continue;
                    };
                    item.rev = None;
                    match mark_at {
                        Some(at) => {
                            item.dirty = Some(false);
                            item.dirty_at = Some(at);
                            earliest_delayed = Some(earliest_delayed.map_or(at, |e| e.min(at)));
                        }
                        None => item.dirty = Some(true),
                    }
                    item.touch(now);
                    key_of.insert(item.id.clone(), key.clone());
                    writes.push(item);
                    synthesized += 1;
                }
            }

            if writes.is_empty() {
                break;
            }

            let results = self.store.bulk_save(writes).await?;
            let mut next = BTreeSet::new();
            let mut saved = 0usize;
            for result in &results {
                match result {
                    BulkSaveResult::Saved { .. } => saved += 1,
                    BulkSaveResult::Conflict { id } => {
                        if let Some(key) = key_of.get(id) {
                            next.insert(key.clone());
                        }
                    }
                    BulkSaveResult::Failed { id, message } => {
                        report.failed += 1;
                        warn!(item_type = %type_name, id = %id, error = %message, "Dirtying write failed");
                    }
                }
            }

            let conflicts = next.len();
            let created_saved = results
                .iter()
                .filter(|r| matches!(r, BulkSaveResult::Saved { .. }))
                .filter(|r| {
                    key_of
                        .get(r.id())
                        .map(|key| !found.contains(key))
                        .unwrap_or(false)
                })
                .count();
            report.created += created_saved;
            report.dirtied += saved - created_saved;
            metrics::record_dirty_round(type_name, saved, conflicts);

            debug!(
                item_type = %type_name,
                round = report.rounds,
                marked,
                synthesized,
                saved,
                conflicts,
                "Dirtying round complete"
            );
            pending = next;
        }

        if let Some(at) = earliest_delayed {
            self.soil.schedule(at);
        }
        metrics::record_dirty_pass(type_name, report.rounds, report.dirtied, report.created);
        Ok(report)
    }
}

impl Dirtier for BulkDirtier {
    fn dirty_if_clean_or_locked(
        &self,
        keys: Vec<String>,
        dirty_after: Option<Duration>,
    ) -> BoxFuture<'_, DirtyReport> {
        Box::pin(self.run(keys, dirty_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryItemStore;

    fn listener_dirtier(store: &MemoryItemStore) -> BulkDirtier {
        BulkDirtier::new(
            Arc::new(store.clone()),
            ItemType::ChangeListener,
            SoilScheduler::new(),
        )
        .with_synthesizer(Arc::new(|key: &str| Some(Item::change_listener(key))))
    }

    async fn seed(store: &MemoryItemStore, db: &str, dirty: bool, locked: bool) -> Item {
        let mut item = Item::change_listener(db);
        item.dirty = Some(dirty);
        if locked {
            item.locked_at = Some(Utc::now());
        }
        store.create(&item).await.unwrap()
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_created_and_locked_dirtied() {
        let store = MemoryItemStore::new();
        seed(&store, "B", false, true).await;

        let report = listener_dirtier(&store)
            .run(keys(&["A", "B"]), None)
            .await
            .unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.dirtied, 1);

        let a = store.get("change_listener_A").await.unwrap().unwrap();
        assert!(a.is_dirty_and_unlocked());
        let b = store.get("change_listener_B").await.unwrap().unwrap();
        assert!(b.is_dirty());
        assert!(b.is_locked());
    }

    #[tokio::test]
    async fn test_queued_items_are_left_alone() {
        let store = MemoryItemStore::new();
        let queued = seed(&store, "Q", true, false).await;

        let report = listener_dirtier(&store).run(keys(&["Q"]), None).await.unwrap();
        assert_eq!(report.dirtied, 0);
        assert_eq!(report.created, 0);

        let after = store.get("change_listener_Q").await.unwrap().unwrap();
        assert_eq!(after.rev, queued.rev);
    }

    #[tokio::test]
    async fn test_conflicted_keys_are_retried() {
        let store = MemoryItemStore::new();
        for db in ["A", "B", "C"] {
            seed(&store, db, false, false).await;
        }
        store
            .interfere_on_next_bulk_save(["change_listener_B", "change_listener_C"])
            .await;

        let report = listener_dirtier(&store)
            .run(keys(&["A", "B", "C"]), None)
            .await
            .unwrap();
        assert_eq!(report.rounds, 2);
        assert_eq!(report.dirtied, 3);

        for db in ["A", "B", "C"] {
            let item = store.get(&format!("change_listener_{}", db)).await.unwrap().unwrap();
            assert!(item.is_dirty(), "{} not dirty", db);
        }
    }

    #[tokio::test]
    async fn test_delayed_marking_sets_dirty_at_and_arms_soil() {
        let store = MemoryItemStore::new();
        seed(&store, "A", false, false).await;
        let dirtier = listener_dirtier(&store);

        let before = Utc::now();
        dirtier
            .run(keys(&["A", "B"]), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let a = store.get("change_listener_A").await.unwrap().unwrap();
        assert!(a.is_clean());
        let at = a.dirty_at.unwrap();
        assert!(at >= before + chrono::Duration::seconds(60));

        let b = store.get("change_listener_B").await.unwrap().unwrap();
        assert!(b.is_clean());
        assert!(b.dirty_at.is_some());

        assert!(dirtier.soil_scheduler().next().unwrap() <= at);
    }

    #[tokio::test]
    async fn test_delayed_keeps_earlier_dirty_at() {
        let store = MemoryItemStore::new();
        let mut item = Item::change_listener("A");
        item.dirty = Some(false);
        let early = Utc::now() + chrono::Duration::seconds(5);
        item.dirty_at = Some(early);
        store.create(&item).await.unwrap();

        listener_dirtier(&store)
            .run(keys(&["A"]), Some(Duration::from_secs(600)))
            .await
            .unwrap();
        let after = store.get("change_listener_A").await.unwrap().unwrap();
        assert_eq!(after.dirty_at, Some(early));
    }

    #[tokio::test]
    async fn test_immediate_marking_clears_dirty_at() {
        let store = MemoryItemStore::new();
        let mut item = Item::change_listener("A");
        item.dirty = Some(false);
        item.dirty_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.create(&item).await.unwrap();

        listener_dirtier(&store).run(keys(&["A"]), None).await.unwrap();
        let after = store.get("change_listener_A").await.unwrap().unwrap();
        assert_eq!(after.dirty, Some(true));
        assert!(after.dirty_at.is_none());
    }

    #[tokio::test]
    async fn test_replicators_are_never_synthesized() {
        let store = MemoryItemStore::new();
        let mut existing = Item::replicator("http://host/users", "http://backup/users");
        existing.dirty = Some(false);
        store.create(&existing).await.unwrap();

        let dirtier = BulkDirtier::new(
            Arc::new(store.clone()),
            ItemType::Replicator,
            SoilScheduler::new(),
        );
        let report = dirtier.run(keys(&["users", "orders"]), None).await.unwrap();
        assert_eq!(report.dirtied, 1);
        assert_eq!(report.created, 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_keys_is_noop() {
        let store = MemoryItemStore::new();
        let report = listener_dirtier(&store).run(vec![String::new()], None).await.unwrap();
        assert_eq!(report, DirtyReport::default());
    }

    #[test]
    fn test_soil_scheduler_earlier_wins() {
        let soil = SoilScheduler::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);

        assert!(soil.schedule(later));
        assert!(soil.schedule(now));
        assert!(!soil.schedule(later));
        assert_eq!(soil.next(), Some(now));

        soil.clear_if(later);
        assert_eq!(soil.next(), Some(now));
        soil.clear_if(now);
        assert_eq!(soil.next(), None);
    }
}
