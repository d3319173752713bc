// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process engine: the generic lock → process → unlock state machine for
//! one item type.
//!
//! The engine ties together:
//! - the per-item cycle in [`cycle`] (locking, conflict handling, deletion
//!   heuristic)
//! - the item change feed, filtered to the dirty view
//! - stall recovery and soiling in [`maintenance`]
//! - a [`Bulkhead`] bounding concurrent cycles
//!
//! # Start sequence
//!
//! ```text
//! ensure_views ──▶ since = last_seq ──▶ sweep dirty+unlocked ──▶ feed(since)
//!                                                             ├─ stall loop
//!                                                             └─ soil loop
//! ```
//!
//! `since` is taken before the sweep so nothing written during the sweep is
//! missed; anything seen twice is skipped by the lock's revision check.
//!
//! Several engines for the same type may run in different processes
//! against the same store. No in-process state is shared between them.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use work_coordinator::config::EngineConfig;
//! # use work_coordinator::engine::{ItemAction, ProcessEngine};
//! # use work_coordinator::store::MemoryItemStore;
//! # async fn run(action: Arc<dyn ItemAction>) -> work_coordinator::Result<()> {
//! let store = Arc::new(MemoryItemStore::new());
//! let engine = ProcessEngine::new(store, action, EngineConfig::default());
//! engine.start().await?;
//! // ...
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

mod cycle;
mod maintenance;
mod types;

pub use types::{EngineState, ItemAction, ProcessOutcome};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use self::cycle::{EngineCore, Redirty};
use crate::config::EngineConfig;
use crate::dirtying::{BulkDirtier, SoilScheduler};
use crate::error::{CoordinatorError, Result};
use crate::item::{Item, ItemType};
use crate::metrics;
use crate::report::{ErrorReport, ErrorReporter, LogReporter};
use crate::resilience::Bulkhead;
use crate::store::{ItemStore, View};

/// How long `stop()` waits for each background loop to exit.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock/process/unlock engine for one item type.
pub struct ProcessEngine {
    core: Arc<EngineCore>,

    stall_check_interval: Duration,

    /// Engine state (broadcast to watchers)
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,

    /// Feed, stall and soil loops
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessEngine {
    /// Create an engine that reports failures to the log.
    pub fn new(store: Arc<dyn ItemStore>, action: Arc<dyn ItemAction>, config: EngineConfig) -> Self {
        Self::with_reporter(store, action, config, Arc::new(LogReporter))
    }

    /// Create an engine with an explicit error reporter.
    pub fn with_reporter(
        store: Arc<dyn ItemStore>,
        action: Arc<dyn ItemAction>,
        config: EngineConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let item_type = action.item_type();
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = EngineCore {
            store,
            action,
            item_type,
            component: format!("engine:{}", item_type),
            bulkhead: Bulkhead::new(config.concurrency),
            soil: SoilScheduler::new(),
            reporter,
            stall_timeout: config.stall_timeout_duration(),
            assume_deleted_after: config.assume_deleted_after_duration(),
            retry_delay: config.retry_delay_duration(),
        };

        Self {
            core: Arc::new(core),
            stall_check_interval: config.stall_check_interval_duration(),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn item_type(&self) -> ItemType {
        self.core.item_type
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Items currently between lock and unlock in this process.
    pub fn in_flight(&self) -> usize {
        self.core.bulkhead.in_flight()
    }

    /// The bulk dirtying protocol for this engine's item type.
    ///
    /// Delayed marks arm this engine's soil timer directly.
    pub fn dirtier(&self) -> BulkDirtier {
        self.core.dirtier()
    }

    pub fn soil_scheduler(&self) -> &SoilScheduler {
        &self.core.soil
    }

    /// Start the engine.
    ///
    /// 1. Ensures the index views exist
    /// 2. Takes the feed checkpoint
    /// 3. Processes every dirty-and-unlocked item (bounded concurrency)
    /// 4. Spawns the feed, stall and soil loops
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(CoordinatorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let type_name = self.core.type_name();
        info!(item_type = %type_name, concurrency = self.core.bulkhead.max_concurrent(), "Starting process engine");
        self.set_state(EngineState::Starting);

        let since = match self.prepare().await {
            Ok(since) => since,
            Err(e) => {
                error!(item_type = %type_name, error = %e, "Process engine failed to start");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let mut handles = self.handles.lock().await;

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = Arc::clone(&self.state_tx);
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        handles.push(tokio::spawn(async move {
            run_feed(core, since, shutdown_rx, state_tx, shutdown_tx).await;
        }));

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_rx.clone();
        let interval = self.stall_check_interval;
        handles.push(tokio::spawn(async move {
            maintenance::run_stall_recovery(core, interval, shutdown_rx).await;
        }));

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            maintenance::run_soil_timer(core, shutdown_rx).await;
        }));
        drop(handles);

        // The feed may already have failed
        if self.state_tx.send_if_modified(|state| promote_to_running(state)) {
            metrics::set_engine_state(type_name, &EngineState::Running.to_string());
        }
        info!(item_type = %type_name, since, "Process engine running");
        Ok(())
    }

    /// Views, checkpoint and initial sweep. Returns the feed checkpoint.
    async fn prepare(&self) -> Result<u64> {
        self.core.store.ensure_views(self.core.item_type).await?;
        let since = self.core.store.last_seq().await?;
        let swept = self.sweep().await?;
        self.core.refresh_soil_timer().await?;
        debug!(item_type = %self.core.type_name(), since, swept, "Initial sweep complete");
        Ok(since)
    }

    /// Process everything currently dirty and unlocked, waiting for all of it.
    async fn sweep(&self) -> Result<usize> {
        let items = self
            .core
            .store
            .query(View::DirtyAndUnlocked(self.core.item_type))
            .await?;
        let count = items.len();
        let mut tasks = JoinSet::new();

        for item in items {
            let permit = self
                .core
                .bulkhead
                .acquire()
                .await
                .map_err(|e| CoordinatorError::Internal(e.to_string()))?;
            let core = Arc::clone(&self.core);
            tasks.spawn(async move {
                core.handle(item).await;
                drop(permit);
                metrics::set_in_flight(core.type_name(), core.bulkhead.in_flight());
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Sweep task panicked");
            }
        }
        Ok(count)
    }

    /// Stop the engine.
    ///
    /// Cancels the feed and the timers, then waits until every in-flight
    /// cycle has unlocked its item. Nothing is abandoned mid-lock.
    pub async fn stop(&self) {
        let type_name = self.core.type_name();
        if self.state() == EngineState::Stopped {
            return;
        }
        info!(item_type = %type_name, "Stopping process engine");
        let failed = self.state() == EngineState::Failed;
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().await);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(LOOP_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Loop stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Loop panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Loop did not stop in time"),
            }
        }

        let in_flight = self.core.bulkhead.in_flight();
        if in_flight > 0 {
            info!(item_type = %type_name, in_flight, "Waiting for in-flight items");
        }
        match self.core.bulkhead.drain().await {
            Ok(all) => drop(all),
            Err(e) => warn!(error = %e, "Failed to drain in-flight items"),
        }
        metrics::set_in_flight(type_name, 0);

        self.set_state(if failed {
            EngineState::Failed
        } else {
            EngineState::Stopped
        });
        info!(item_type = %type_name, "Process engine stopped");
    }

    fn set_state(&self, state: EngineState) {
        set_state(&self.state_tx, self.core.type_name(), state);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Item operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one lock → process → unlock cycle on an item as read.
    pub async fn process_item(&self, item: Item) -> Result<ProcessOutcome> {
        self.core.process_item(item).await
    }

    /// Conditionally lock an item. `None` means another worker got there first.
    pub async fn lock(&self, item: &Item) -> Result<Option<Item>> {
        self.core.lock(item).await
    }

    /// Unlock a locked item, cleaning it unless `leave_dirty`.
    ///
    /// Falls back to an upserting unlock that keeps the item dirty when the
    /// conditional write conflicts.
    pub async fn unlock_and_clean(&self, item: Item, leave_dirty: bool) -> Result<Option<Item>> {
        self.core.unlock_and_clean(item, leave_dirty).await
    }

    /// Unlock the latest revision of `id` and leave it dirty.
    pub async fn upsert_unlock_redirty(&self, id: &str) -> Result<Option<Item>> {
        self.core.upsert_unlock(id, None, Redirty::Now).await
    }

    /// Destroy an item's conflicting sibling revisions.
    pub async fn resolve_conflicts(&self, item: &Item) -> Result<usize> {
        self.core.resolve_conflicts(item).await
    }

    /// One stall-recovery sweep.
    pub async fn recover_stalled(&self) -> Result<usize> {
        self.core.recover_stalled().await
    }

    /// One soil pass: mark due delayed items dirty.
    pub async fn soil(&self) -> Result<usize> {
        self.core.soil().await
    }
}

/// `Starting` → `Running`, leaving any other state alone.
pub(crate) fn promote_to_running(state: &mut EngineState) -> bool {
    if *state == EngineState::Starting {
        *state = EngineState::Running;
        true
    } else {
        false
    }
}

fn set_state(state_tx: &watch::Sender<EngineState>, type_name: &str, state: EngineState) {
    let _ = state_tx.send(state);
    metrics::set_engine_state(type_name, &state.to_string());
}

/// Consume the dirty feed until shutdown or failure.
async fn run_feed(
    core: Arc<EngineCore>,
    since: u64,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<EngineState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let span = info_span!("item_feed", item_type = %core.type_name());
    async move {
        let mut sub = core.store.changes(core.item_type, since);

        loop {
            let entry = tokio::select! {
                entry = sub.next() => entry,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let change = match entry {
                Some(Ok(change)) => change,
                Some(Err(e)) => {
                    fail(&core, &state_tx, &shutdown_tx, format!("item feed failed: {}", e));
                    break;
                }
                None => {
                    if !*shutdown_rx.borrow() {
                        fail(&core, &state_tx, &shutdown_tx, "item feed closed".to_string());
                    }
                    break;
                }
            };

            let item = change.item;
            if !item.has_conflicts() && !item.is_dirty_and_unlocked() {
                continue;
            }

            let permit = tokio::select! {
                permit = core.bulkhead.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let task_core = Arc::clone(&core);
            metrics::set_in_flight(core.type_name(), core.bulkhead.in_flight());
            tokio::spawn(async move {
                task_core.handle(item).await;
                drop(permit);
                metrics::set_in_flight(task_core.type_name(), task_core.bulkhead.in_flight());
            });
        }

        sub.cancel();
        debug!("Item feed stopped");
    }
    .instrument(span)
    .await
}

fn fail(
    core: &EngineCore,
    state_tx: &watch::Sender<EngineState>,
    shutdown_tx: &watch::Sender<bool>,
    message: String,
) {
    error!(item_type = %core.type_name(), error = %message, "Fatal feed failure");
    metrics::record_error(&core.component, "feed");
    core.reporter.report(ErrorReport::fatal(&core.component, message));
    set_state(state_tx, core.type_name(), EngineState::Failed);
    // Stop the timers too
    let _ = shutdown_tx.send(true);
}
