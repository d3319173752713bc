// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Update batcher: turns database-update notifications into dirty items.
//!
//! # Design
//!
//! ```text
//! UpdatesFeed ──▶ fold ──▶ touched: BTreeSet<db_name> ──┬─▶ size >= batch_size
//!                  │                                    └─▶ window timer fired
//!                  │                                              │
//!                  ▼                                              ▼
//!             excluded dbs                    replicators.dirty_if_clean_or_locked(keys)
//!             (skipped)                       matcher.match_with_target_keys(keys)
//!                                             listeners.dirty_if_clean_or_locked(matched)
//!                                                                 │
//!                                                                 ▼
//!                                              checkpoint (at most every save_seq_after)
//! ```
//!
//! Folding and flushing share one mutex. A flush runs with the lock held, so
//! no notification is folded while a batch is being dirtied and the next
//! batch only starts once the previous one is fully applied.
//!
//! # Checkpoint Semantics
//!
//! The checkpoint is the sequence of the last notification whose batch was
//! successfully flushed. Notifications folded into a batch that was never
//! flushed (stop, crash, dirtying failure) are read again after a restart.
//! Dirtying is idempotent, so replay is safe.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::config::BatcherConfig;
use crate::dirtying::{Dirtier, DirtyReport};
use crate::engine::{promote_to_running, EngineState};
use crate::error::{CoordinatorError, Result};
use crate::feed::FeedSubscription;
use crate::matcher::InterestMatcher;
use crate::metrics;
use crate::report::{ErrorReport, ErrorReporter, LogReporter};
use crate::updates::{DbUpdate, UpdatesFeed};

const COMPONENT: &str = "update_batcher";

/// How long `stop()` waits for the feed loop to exit.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one batch flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct databases in the batch.
    pub keys: usize,
    /// Databases that passed the interest matcher.
    pub matched: usize,
    pub replicators: DirtyReport,
    pub change_listeners: DirtyReport,
}

/// The batch being formed plus checkpoint bookkeeping.
#[derive(Debug, Default)]
struct Batch {
    touched: BTreeSet<String>,
    /// Last sequence folded into `touched`
    last_seq: Option<String>,
    /// When the first notification of this batch arrived
    started: Option<Instant>,
    /// Checkpoint candidate
    flushed_seq: Option<String>,
    saved_seq: Option<String>,
    last_save: Option<Instant>,
}

/// Collaborators shared by the feed loop and the public API.
struct BatcherInner {
    feed: Arc<dyn UpdatesFeed>,
    checkpoints: Arc<dyn CheckpointStore>,
    replicators: Arc<dyn Dirtier>,
    listeners: Arc<dyn Dirtier>,
    matcher: Arc<dyn InterestMatcher>,
    reporter: Arc<dyn ErrorReporter>,
    config: BatcherConfig,
    batch: Mutex<Batch>,
}

/// Coalesces update notifications into bulk dirtying calls.
pub struct UpdateBatcher {
    inner: Arc<BatcherInner>,
    state_tx: Arc<watch::Sender<EngineState>>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateBatcher {
    /// Create a batcher.
    ///
    /// `replicators` and `listeners` are the dirtiers of the two downstream
    /// item types; only `listeners` is filtered through `matcher`.
    pub fn new(
        feed: Arc<dyn UpdatesFeed>,
        checkpoints: Arc<dyn CheckpointStore>,
        replicators: Arc<dyn Dirtier>,
        listeners: Arc<dyn Dirtier>,
        matcher: Arc<dyn InterestMatcher>,
        config: BatcherConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(BatcherInner {
                feed,
                checkpoints,
                replicators,
                listeners,
                matcher,
                reporter: Arc::new(LogReporter),
                config,
                batch: Mutex::new(Batch::default()),
            }),
            state_tx: Arc::new(state_tx),
            state_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Replace the error reporter. Only valid before `start()`.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.reporter = reporter;
        }
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Databases waiting in the current batch.
    pub async fn pending(&self) -> usize {
        self.inner.batch.lock().await.touched.len()
    }

    /// The last persisted checkpoint.
    pub async fn saved_seq(&self) -> Option<String> {
        self.inner.batch.lock().await.saved_seq.clone()
    }

    /// Resume from the stored checkpoint and start consuming the feed.
    pub async fn start(&self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(CoordinatorError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.set_state(EngineState::Starting);

        let key = &self.inner.config.checkpoint_key;
        let since = match self.inner.checkpoints.get(key).await {
            Ok(since) => since,
            Err(e) => {
                error!(error = %e, "Failed to load batcher checkpoint");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        {
            let mut batch = self.inner.batch.lock().await;
            batch.saved_seq = since.clone();
            batch.flushed_seq = since.clone();
        }
        info!(
            checkpoint_key = %key,
            since = since.as_deref().unwrap_or("now"),
            batch_size = self.inner.config.batch_size,
            "Starting update batcher"
        );

        // Subscribe before returning so nothing published after start() is missed
        let sub = self.inner.feed.subscribe(since);
        let inner = Arc::clone(&self.inner);
        let shutdown_rx = self.shutdown_rx.clone();
        let state_tx = Arc::clone(&self.state_tx);
        let shutdown_tx = Arc::clone(&self.shutdown_tx);
        *self.handle.lock().await = Some(tokio::spawn(async move {
            run(inner, sub, shutdown_rx, state_tx, shutdown_tx).await;
        }));

        // The loop may already have failed
        if self.state_tx.send_if_modified(|state| promote_to_running(state)) {
            metrics::set_engine_state(COMPONENT, &EngineState::Running.to_string());
        }
        Ok(())
    }

    /// Stop consuming and persist the checkpoint.
    ///
    /// A partially formed batch is dropped, not flushed; its notifications
    /// are after the checkpoint and are read again on restart.
    pub async fn stop(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }
        info!("Stopping update batcher");
        let failed = self.state() == EngineState::Failed;
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.handle.lock().await.take() {
            match tokio::time::timeout(LOOP_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Batcher loop panicked during shutdown"),
                Err(_) => warn!("Batcher loop did not stop in time"),
            }
        }

        let mut batch = self.inner.batch.lock().await;
        if !batch.touched.is_empty() {
            debug!(pending = batch.touched.len(), "Dropping unflushed batch");
        }
        self.inner.save_checkpoint(&mut batch, true).await;
        drop(batch);

        self.set_state(if failed {
            EngineState::Failed
        } else {
            EngineState::Stopped
        });
        info!("Update batcher stopped");
    }

    /// Close the current batch now.
    pub async fn flush(&self) -> Result<FlushReport> {
        let mut batch = self.inner.batch.lock().await;
        let report = self.inner.flush_locked(&mut batch).await?;
        self.inner.save_checkpoint(&mut batch, false).await;
        Ok(report)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(COMPONENT, &state.to_string());
    }
}

impl BatcherInner {
    /// Add one notification to the current batch, flushing when full.
    async fn fold(&self, update: DbUpdate) {
        let mut batch = self.batch.lock().await;

        if self.config.is_excluded(&update.db_name) {
            metrics::record_update_events(1, 1);
            if batch.touched.is_empty() {
                // Nothing pending ahead of it, safe to checkpoint past it
                batch.flushed_seq = Some(update.seq);
                self.save_checkpoint(&mut batch, false).await;
            } else {
                batch.last_seq = Some(update.seq);
            }
            return;
        }

        metrics::record_update_events(1, 0);
        if batch.started.is_none() {
            batch.started = Some(Instant::now());
        }
        batch.touched.insert(update.db_name);
        batch.last_seq = Some(update.seq);

        if batch.touched.len() >= self.config.batch_size.max(1)
            && self.flush_locked(&mut batch).await.is_ok()
        {
            self.save_checkpoint(&mut batch, false).await;
        }
    }

    /// Flush if the window expired, save the checkpoint if due.
    async fn tick(&self) {
        let mut batch = self.batch.lock().await;
        let expired = batch
            .started
            .map(|started| started.elapsed() >= self.config.batch_timeout_duration())
            .unwrap_or(false);
        if expired && self.flush_locked(&mut batch).await.is_err() {
            return;
        }
        self.save_checkpoint(&mut batch, false).await;
    }

    /// Next time `tick()` has something to do.
    async fn next_wake(&self) -> Option<Instant> {
        let batch = self.batch.lock().await;
        let window = batch
            .started
            .map(|started| started + self.config.batch_timeout_duration());
        let save = if batch.flushed_seq.is_some() && batch.flushed_seq != batch.saved_seq {
            Some(
                batch
                    .last_save
                    .map_or_else(Instant::now, |at| at + self.config.save_seq_after_duration()),
            )
        } else {
            None
        };
        match (window, save) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Dirty every touched database. Caller holds the batch lock.
    ///
    /// On failure the keys stay in the batch and are retried once the
    /// window expires again.
    #[instrument(skip(self, batch), fields(keys = batch.touched.len()))]
    async fn flush_locked(&self, batch: &mut Batch) -> Result<FlushReport> {
        if batch.touched.is_empty() {
            batch.started = None;
            return Ok(FlushReport::default());
        }

        let keys: Vec<String> = std::mem::take(&mut batch.touched).into_iter().collect();
        let seq = batch.last_seq.take();
        batch.started = None;
        let started = std::time::Instant::now();

        match self.dirty(keys.clone()).await {
            Ok(report) => {
                metrics::record_batch_flush(report.keys, report.matched, started.elapsed());
                debug!(
                    keys = report.keys,
                    matched = report.matched,
                    replicators = report.replicators.dirtied + report.replicators.created,
                    change_listeners = report.change_listeners.dirtied + report.change_listeners.created,
                    duration_ms = started.elapsed().as_millis(),
                    "Batch flushed"
                );
                if seq.is_some() {
                    batch.flushed_seq = seq;
                }
                Ok(report)
            }
            Err(e) => {
                warn!(keys = keys.len(), error = %e, "Batch flush failed, keeping keys");
                metrics::record_error(COMPONENT, "flush");
                self.reporter.report(ErrorReport::warning(COMPONENT, e.to_string()));
                batch.touched.extend(keys);
                // Anything folded meanwhile is newer
                if batch.last_seq.is_none() {
                    batch.last_seq = seq;
                }
                batch.started = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Both item types are dirtied concurrently; they share no items.
    async fn dirty(&self, keys: Vec<String>) -> Result<FlushReport> {
        let count = keys.len();
        let listeners = async {
            let matched = self.matcher.match_with_target_keys(keys.clone()).await?;
            let matched_count = matched.len();
            let report = if matched.is_empty() {
                DirtyReport::default()
            } else {
                self.listeners.dirty_if_clean_or_locked(matched, None).await?
            };
            Ok::<_, CoordinatorError>((matched_count, report))
        };
        let (replicators, (matched, change_listeners)) = futures::try_join!(
            self.replicators.dirty_if_clean_or_locked(keys.clone(), None),
            listeners
        )?;
        Ok(FlushReport {
            keys: count,
            matched,
            replicators,
            change_listeners,
        })
    }

    /// Persist the checkpoint, at most once per `save_seq_after` unless forced.
    async fn save_checkpoint(&self, batch: &mut Batch, force: bool) {
        let Some(seq) = batch.flushed_seq.clone() else {
            return;
        };
        if batch.saved_seq.as_ref() == Some(&seq) {
            return;
        }
        if !force {
            if let Some(at) = batch.last_save {
                if at.elapsed() < self.config.save_seq_after_duration() {
                    return;
                }
            }
        }

        match self.checkpoints.set(&self.config.checkpoint_key, &seq).await {
            Ok(()) => {
                debug!(seq = %seq, "Saved batcher checkpoint");
                metrics::record_checkpoint_saved(true);
                batch.saved_seq = Some(seq);
                batch.last_save = Some(Instant::now());
            }
            Err(e) => {
                warn!(seq = %seq, error = %e, "Failed to save batcher checkpoint");
                metrics::record_checkpoint_saved(false);
                // Back off until the next save interval
                batch.last_save = Some(Instant::now());
            }
        }
    }
}

/// Feed loop: fold notifications, flush on window expiry, until shutdown.
async fn run(
    inner: Arc<BatcherInner>,
    mut sub: FeedSubscription<DbUpdate>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<EngineState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    let span = info_span!("update_batcher");
    async move {
        loop {
            let wake = inner.next_wake().await;

            tokio::select! {
                entry = sub.next() => match entry {
                    Some(Ok(update)) => inner.fold(update).await,
                    Some(Err(e)) => {
                        fail(&inner, &state_tx, &shutdown_tx, format!("updates feed failed: {}", e));
                        break;
                    }
                    None => {
                        if !*shutdown_rx.borrow() {
                            fail(&inner, &state_tx, &shutdown_tx, "updates feed closed".to_string());
                        }
                        break;
                    }
                },
                _ = sleep_until(wake), if wake.is_some() => inner.tick().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        sub.cancel();
        debug!("Update batcher loop stopped");
    }
    .instrument(span)
    .await
}

async fn sleep_until(at: Option<Instant>) {
    if let Some(at) = at {
        tokio::time::sleep_until(at).await;
    }
}

fn fail(
    inner: &BatcherInner,
    state_tx: &watch::Sender<EngineState>,
    shutdown_tx: &watch::Sender<bool>,
    message: String,
) {
    error!(error = %message, "Fatal updates feed failure");
    metrics::record_error(COMPONENT, "feed");
    inner.reporter.report(ErrorReport::fatal(COMPONENT, message));
    let _ = state_tx.send(EngineState::Failed);
    metrics::set_engine_state(COMPONENT, &EngineState::Failed.to_string());
    let _ = shutdown_tx.send(true);
}
