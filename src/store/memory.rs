// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process item store.
//!
//! Keeps revisioned documents in a map and a change log that holds only the
//! latest sequence per document, the same compaction a document database
//! applies to its change feed. Subscribers wait on a `watch` channel carrying
//! the head sequence.
//!
//! Two hooks simulate what other cluster nodes would do:
//! - [`MemoryItemStore::inject_conflict()`] adds a sibling revision, as a
//!   replicated concurrent write would
//! - [`MemoryItemStore::interfere_on_next_bulk_save()`] bumps documents
//!   right before the next bulk write so it reports conflicts
//! - [`MemoryItemStore::interfere_on_bulk_saves()`] bumps one document per
//!   bulk write, modelling a writer that keeps racing the retries

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use super::{make_rev, BoxFuture, BulkSaveResult, ItemChange, ItemStore, View};
use crate::error::{CoordinatorError, Result};
use crate::feed::{FeedSink, FeedSubscription};
use crate::item::{Item, ItemType};

#[derive(Debug, Clone)]
struct Record {
    generation: u64,
    rev: String,
    item: Item,
    conflicts: BTreeMap<String, Item>,
}

impl Record {
    fn materialize(&self) -> Item {
        let mut item = self.item.clone();
        item.rev = Some(self.rev.clone());
        item.conflicts = self.conflicts.keys().cloned().collect();
        item
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, Record>,
    /// seq -> id, latest sequence per document only
    changes: BTreeMap<u64, String>,
    seq_of: HashMap<String, u64>,
    seq: u64,
    next_id: u64,
    interference: HashSet<String>,
    /// One bump per bulk write, in order
    interference_queue: VecDeque<String>,
}

impl Inner {
    fn record_change(&mut self, id: &str) -> u64 {
        self.seq += 1;
        if let Some(old) = self.seq_of.insert(id.to_string(), self.seq) {
            self.changes.remove(&old);
        }
        self.changes.insert(self.seq, id.to_string());
        self.seq
    }

    fn write(&mut self, mut item: Item, generation: u64, conflicts: BTreeMap<String, Item>) -> Item {
        item.rev = None;
        item.conflicts.clear();
        let rev = make_rev(generation, &item);
        let record = Record {
            generation,
            rev,
            item,
            conflicts,
        };
        let materialized = record.materialize();
        self.items.insert(materialized.id.clone(), record);
        self.record_change(&materialized.id);
        materialized
    }

    fn create(&mut self, item: &Item) -> Result<Item> {
        let mut item = item.clone();
        if item.id.is_empty() {
            self.next_id += 1;
            item.id = format!("item-{:08}", self.next_id);
        }
        if self.items.contains_key(&item.id) {
            return Err(CoordinatorError::conflict(&item.id));
        }
        Ok(self.write(item, 1, BTreeMap::new()))
    }

    fn update(&mut self, item: &Item) -> Result<Item> {
        let Some(record) = self.items.get(&item.id) else {
            return Err(CoordinatorError::conflict(&item.id));
        };
        if item.rev.as_deref() != Some(record.rev.as_str()) {
            return Err(CoordinatorError::conflict(&item.id));
        }
        let generation = record.generation + 1;
        let conflicts = record.conflicts.clone();
        Ok(self.write(item.clone(), generation, conflicts))
    }

    /// Concurrent writer touching a document behind our back.
    fn interfere(&mut self, id: &str) {
        if let Some(record) = self.items.get(id) {
            let mut item = record.materialize();
            item.touch(Utc::now());
            let generation = record.generation + 1;
            let conflicts = record.conflicts.clone();
            self.write(item, generation, conflicts);
        }
    }
}

/// In-memory [`ItemStore`].
#[derive(Clone)]
pub struct MemoryItemStore {
    inner: Arc<Mutex<Inner>>,
    head: Arc<watch::Sender<u64>>,
}

impl Default for MemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryItemStore {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            head: Arc::new(head),
        }
    }

    fn publish(&self, seq: u64) {
        self.head.send_replace(seq);
    }

    /// Add a conflicting sibling revision to an existing item.
    ///
    /// Returns the sibling's revision.
    pub async fn inject_conflict(&self, id: &str, sibling: Item) -> Result<String> {
        let seq;
        let rev;
        {
            let mut inner = self.inner.lock().await;
            let Some(record) = inner.items.get_mut(id) else {
                return Err(CoordinatorError::not_found(id));
            };
            let mut sibling = sibling;
            sibling.id = id.to_string();
            sibling.rev = None;
            sibling.conflicts.clear();
            // Same generation as the winner, different content
            let mut candidate = make_rev(record.generation, &sibling);
            if candidate == record.rev {
                candidate = format!("{}x", candidate);
            }
            record.conflicts.insert(candidate.clone(), sibling);
            rev = candidate;
            seq = inner.record_change(id);
        }
        self.publish(seq);
        Ok(rev)
    }

    /// Bump these documents right before the next bulk write touching them.
    pub async fn interfere_on_next_bulk_save<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock().await;
        inner.interference.extend(ids.into_iter().map(Into::into));
    }

    /// Queue one bump per upcoming bulk write.
    ///
    /// Each bulk write pops the next id and bumps that document first if the
    /// write touches it. Queuing the same id `k` times makes `k` consecutive
    /// writes of it conflict.
    pub async fn interfere_on_bulk_saves<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.inner.lock().await;
        inner.interference_queue.extend(ids.into_iter().map(Into::into));
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All winning revisions (for assertions).
    pub async fn all(&self) -> Vec<Item> {
        let inner = self.inner.lock().await;
        let mut items: Vec<Item> = inner.items.values().map(Record::materialize).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }
}

impl ItemStore for MemoryItemStore {
    fn ensure_views(&self, _item_type: ItemType) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Option<Item>> {
        let id = id.to_string();
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner.items.get(&id).map(Record::materialize))
        })
    }

    fn create(&self, item: &Item) -> BoxFuture<'_, Item> {
        let item = item.clone();
        Box::pin(async move {
            let (created, seq) = {
                let mut inner = self.inner.lock().await;
                let created = inner.create(&item)?;
                (created, inner.seq)
            };
            self.publish(seq);
            Ok(created)
        })
    }

    fn update(&self, item: &Item) -> BoxFuture<'_, Item> {
        let item = item.clone();
        Box::pin(async move {
            let (updated, seq) = {
                let mut inner = self.inner.lock().await;
                let updated = inner.update(&item)?;
                (updated, inner.seq)
            };
            self.publish(seq);
            Ok(updated)
        })
    }

    fn destroy(&self, id: &str, rev: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        let rev = rev.to_string();
        Box::pin(async move {
            let seq = {
                let mut inner = self.inner.lock().await;
                let Some(record) = inner.items.get_mut(&id) else {
                    return Err(CoordinatorError::not_found(&id));
                };

                if record.conflicts.remove(&rev).is_some() {
                    // Sibling removed, winner unchanged
                } else if record.rev == rev {
                    // Winner removed: promote the highest sibling, if any
                    let promoted = record
                        .conflicts
                        .iter()
                        .next_back()
                        .map(|(r, item)| (r.clone(), item.clone()));
                    match promoted {
                        Some((sibling_rev, sibling)) => {
                            record.conflicts.remove(&sibling_rev);
                            record.rev = sibling_rev;
                            record.item = sibling;
                        }
                        None => {
                            inner.items.remove(&id);
                        }
                    }
                } else {
                    return Err(CoordinatorError::conflict(&id));
                }
                inner.record_change(&id)
            };
            self.publish(seq);
            Ok(())
        })
    }

    fn bulk_save(&self, items: Vec<Item>) -> BoxFuture<'_, Vec<BulkSaveResult>> {
        Box::pin(async move {
            let (results, seq) = {
                let mut inner = self.inner.lock().await;

                for item in &items {
                    if inner.interference.remove(&item.id) {
                        inner.interfere(&item.id);
                    }
                }
                if let Some(id) = inner.interference_queue.pop_front() {
                    if items.iter().any(|item| item.id == id) {
                        inner.interfere(&id);
                    }
                }

                let mut results = Vec::with_capacity(items.len());
                for item in &items {
                    let outcome = if item.rev.is_none() {
                        inner.create(item)
                    } else {
                        inner.update(item)
                    };
                    results.push(match outcome {
                        Ok(saved) => BulkSaveResult::Saved {
                            id: saved.id.clone(),
                            rev: saved.rev.unwrap_or_default(),
                        },
                        Err(e) if e.is_conflict() => BulkSaveResult::Conflict {
                            id: item.id.clone(),
                        },
                        Err(e) => BulkSaveResult::Failed {
                            id: item.id.clone(),
                            message: e.to_string(),
                        },
                    });
                }
                (results, inner.seq)
            };
            self.publish(seq);
            Ok(results)
        })
    }

    fn query(&self, view: View) -> BoxFuture<'_, Vec<Item>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut items: Vec<Item> = inner
                .items
                .values()
                .map(Record::materialize)
                .filter(|item| view.matches(item))
                .collect();

            match &view {
                View::SoilableBefore { .. } | View::EarliestDirtyAt(_) => {
                    items.sort_by(|a, b| a.dirty_at.cmp(&b.dirty_at));
                }
                _ => items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id))),
            }
            if matches!(view, View::EarliestDirtyAt(_)) {
                items.truncate(1);
            }
            Ok(items)
        })
    }

    fn last_seq(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move { Ok(self.inner.lock().await.seq) })
    }

    fn changes(&self, item_type: ItemType, since: u64) -> FeedSubscription<ItemChange> {
        let inner = Arc::clone(&self.inner);
        let mut head = self.head.subscribe();

        FeedSubscription::spawn(move |mut sink: FeedSink<ItemChange>| async move {
            let mut cursor = since;
            loop {
                head.borrow_and_update();

                let batch: Vec<(u64, Option<Item>)> = {
                    let inner = inner.lock().await;
                    inner
                        .changes
                        .range(cursor + 1..)
                        .map(|(seq, id)| (*seq, inner.items.get(id).map(Record::materialize)))
                        .collect()
                };

                for (seq, item) in batch {
                    cursor = seq;
                    let Some(item) = item else { continue };
                    if item.item_type != item_type || !(item.is_dirty() || item.has_conflicts()) {
                        continue;
                    }
                    if !sink.send(Ok(ItemChange { seq, item })).await {
                        return;
                    }
                }

                tokio::select! {
                    changed = head.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sink.cancelled() => return,
                }
            }
        })
    }
}
