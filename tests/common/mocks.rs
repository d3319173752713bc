// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fake collaborators that record what the coordinator asked of them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use work_coordinator::dirtying::{Dirtier, DirtyReport};
use work_coordinator::item::ReplicatorSpec;
use work_coordinator::kinds::{ChangeDispatcher, ChangesPage, ReplicationClient, SourceChange, SourceChanges};
use work_coordinator::store::BoxFuture;
use work_coordinator::{CoordinatorError, Item, ItemAction, ItemType};

/// Replication endpoint that records every replication it was asked to run.
#[derive(Default)]
pub struct FakeReplication {
    runs: Mutex<Vec<(String, String)>>,
    missing: Mutex<HashSet<String>>,
}

impl FakeReplication {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make replications from `source` fail with target-not-found.
    pub fn remove_source(&self, source: &str) {
        self.missing.lock().unwrap().insert(source.to_string());
    }

    pub fn runs(&self) -> Vec<(String, String)> {
        self.runs.lock().unwrap().clone()
    }
}

impl ReplicationClient for FakeReplication {
    fn replicate<'a>(&'a self, spec: &'a ReplicatorSpec) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.missing.lock().unwrap().contains(&spec.source) {
                return Err(CoordinatorError::target_not_found(spec.source.clone()));
            }
            self.runs
                .lock()
                .unwrap()
                .push((spec.source.clone(), spec.target.clone()));
            Ok(())
        })
    }
}

/// Source databases whose change feeds are plain counters.
///
/// A database with `n` changes has sequences `1..=n`.
#[derive(Default)]
pub struct FakeSource {
    dbs: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append `count` changes to `db`, creating it if needed.
    pub fn write(&self, db: &str, count: usize) {
        *self.dbs.lock().unwrap().entry(db.to_string()).or_default() += count;
    }

    pub fn drop_db(&self, db: &str) {
        self.dbs.lock().unwrap().remove(db);
    }
}

impl SourceChanges for FakeSource {
    fn fetch<'a>(&'a self, db_name: &'a str, since: Option<&'a str>, limit: usize) -> BoxFuture<'a, ChangesPage> {
        Box::pin(async move {
            let Some(total) = self.dbs.lock().unwrap().get(db_name).copied() else {
                return Err(CoordinatorError::target_not_found(db_name));
            };
            let start: usize = since.and_then(|s| s.parse().ok()).unwrap_or(0).min(total);
            let end = (start + limit).min(total);
            let changes = (start + 1..=end)
                .map(|n| SourceChange {
                    seq: n.to_string(),
                    id: format!("{}/{}", db_name, n),
                    deleted: false,
                    doc: None,
                })
                .collect();
            Ok(ChangesPage {
                changes,
                last_seq: end.to_string(),
                pending: (total - end) as u64,
            })
        })
    }
}

/// Dispatcher collecting change ids per database.
#[derive(Default)]
pub struct CollectingDispatcher {
    seen: Mutex<HashMap<String, Vec<String>>>,
}

impl CollectingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self, db: &str) -> Vec<String> {
        self.seen.lock().unwrap().get(db).cloned().unwrap_or_default()
    }
}

impl ChangeDispatcher for CollectingDispatcher {
    fn dispatch<'a>(&'a self, db_name: &'a str, changes: Vec<SourceChange>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap()
                .entry(db_name.to_string())
                .or_default()
                .extend(changes.into_iter().map(|c| c.id));
            Ok(())
        })
    }
}

/// Action that counts cycles per item id and optionally sleeps.
pub struct CountingAction {
    item_type: ItemType,
    delay: Duration,
    total: AtomicUsize,
    per_item: Mutex<HashMap<String, usize>>,
}

impl CountingAction {
    pub fn new(item_type: ItemType) -> Arc<Self> {
        Self::with_delay(item_type, Duration::ZERO)
    }

    pub fn with_delay(item_type: ItemType, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            item_type,
            delay,
            total: AtomicUsize::new(0),
            per_item: Mutex::new(HashMap::new()),
        })
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn count(&self, id: &str) -> usize {
        self.per_item.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

impl ItemAction for CountingAction {
    fn item_type(&self) -> ItemType {
        self.item_type
    }

    fn process<'a>(&'a self, item: &'a mut Item) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.total.fetch_add(1, Ordering::SeqCst);
            *self
                .per_item
                .lock()
                .unwrap()
                .entry(item.id.clone())
                .or_default() += 1;
            Ok(false)
        })
    }
}

/// Dirtier that records each call's keys.
#[derive(Default)]
pub struct RecordingDirtier {
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingDirtier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dirtier for RecordingDirtier {
    fn dirty_if_clean_or_locked(
        &self,
        keys: Vec<String>,
        _dirty_after: Option<Duration>,
    ) -> BoxFuture<'_, DirtyReport> {
        Box::pin(async move {
            let dirtied = keys.len();
            self.calls.lock().unwrap().push(keys);
            Ok(DirtyReport {
                rounds: 1,
                dirtied,
                ..Default::default()
            })
        })
    }
}

/// Poll `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
