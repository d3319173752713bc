// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background maintenance: stall recovery and soiling.
//!
//! # Stall recovery
//!
//! A worker that crashes while holding a lock leaves the item locked
//! forever. Every `stall_check_interval` the locked view is scanned and any
//! lock older than `stall_timeout` is released with a plain conditional
//! write (two recoverers racing is fine, the loser gets a conflict).
//!
//! # Soiling
//!
//! Items marked with `dirty_at` instead of `dirty: true` wait for that time.
//! One timer is kept for the earliest pending `dirty_at`; when it fires all
//! due items are marked dirty and the timer is re-armed for the next
//! earliest one. Delayed items written by other processes are discovered
//! by the stall sweep, which also refreshes the timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cycle::EngineCore;
use crate::error::Result;
use crate::metrics;
use crate::report::ErrorReport;
use crate::store::{BulkSaveResult, View};

/// Minimum gap between soil passes, so an item that keeps failing to soil
/// cannot spin the timer.
const MIN_SOIL_GAP: Duration = Duration::from_millis(10);

/// Wait before re-running a soil pass that failed, in milliseconds.
const SOIL_RETRY_MS: i64 = 500;

impl EngineCore {
    /// Unlock every item locked for longer than the stall timeout.
    ///
    /// Returns how many were released by this call.
    pub(crate) async fn recover_stalled(&self) -> Result<usize> {
        let now = Utc::now();
        let locked = self.store.query(View::Locked(self.item_type)).await?;
        let mut recovered = 0;

        for mut item in locked {
            let Some(locked_at) = item.locked_at else {
                continue;
            };
            let stalled = (now - locked_at)
                .to_std()
                .map(|age| age > self.stall_timeout)
                .unwrap_or(false);
            if !stalled {
                continue;
            }

            item.locked_at = None;
            item.dirty = Some(true);
            item.touch(now);
            match self.store.update(&item).await {
                Ok(_) => {
                    recovered += 1;
                    info!(
                        item_type = %self.type_name(),
                        id = %item.id,
                        locked_at = %locked_at,
                        "Recovered stalled item"
                    );
                }
                Err(e) if e.is_conflict() => {
                    debug!(id = %item.id, "Stalled item changed concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        metrics::record_stalled_recovered(self.type_name(), recovered);
        Ok(recovered)
    }

    /// Mark every item whose `dirty_at` has passed as dirty, then re-arm the
    /// soil timer for the next pending one.
    pub(crate) async fn soil(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self
            .store
            .query(View::SoilableBefore {
                item_type: self.item_type,
                until: now,
            })
            .await?;

        let mut soiled = 0;
        if !due.is_empty() {
            let writes = due
                .into_iter()
                .map(|mut item| {
                    item.dirty = Some(true);
                    item.dirty_at = None;
                    item.touch(now);
                    item
                })
                .collect();
            for result in self.store.bulk_save(writes).await? {
                match result {
                    BulkSaveResult::Saved { .. } => soiled += 1,
                    BulkSaveResult::Conflict { id } => {
                        debug!(id = %id, "Soil conflict, will retry on next pass");
                    }
                    BulkSaveResult::Failed { id, message } => {
                        warn!(id = %id, error = %message, "Failed to soil item");
                    }
                }
            }
        }

        metrics::record_soiled(self.type_name(), soiled);
        self.refresh_soil_timer().await?;
        Ok(soiled)
    }

    /// Arm the soil timer from the earliest `dirty_at` in the store.
    pub(crate) async fn refresh_soil_timer(&self) -> Result<()> {
        let earliest = self
            .store
            .query(View::EarliestDirtyAt(self.item_type))
            .await?;
        if let Some(at) = earliest.first().and_then(|item| item.dirty_at) {
            self.soil.schedule(at);
        }
        Ok(())
    }
}

/// Periodic stall sweep until shutdown.
pub(crate) async fn run_stall_recovery(
    core: Arc<EngineCore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("stall_recovery", item_type = %core.type_name());
    async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = core.recover_stalled().await {
                        warn!(error = %e, "Stall sweep failed");
                        core.reporter.report(ErrorReport::warning(&core.component, e.to_string()));
                    }
                    if let Err(e) = core.refresh_soil_timer().await {
                        warn!(error = %e, "Soil timer refresh failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Stall recovery stopping");
                        break;
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Soil timer loop until shutdown.
pub(crate) async fn run_soil_timer(core: Arc<EngineCore>, mut shutdown_rx: watch::Receiver<bool>) {
    let span = info_span!("soil_timer", item_type = %core.type_name());
    async move {
        let mut next_rx = core.soil.subscribe();

        loop {
            let next = *next_rx.borrow_and_update();
            let wait = next
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::ZERO)
                .max(MIN_SOIL_GAP);

            tokio::select! {
                _ = tokio::time::sleep(wait), if next.is_some() => {
                    if let Some(at) = next {
                        core.soil.clear_if(at);
                    }
                    match core.soil().await {
                        Ok(count) if count > 0 => debug!(count, "Soiled due items"),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Soil pass failed, re-arming timer");
                            core.reporter.report(ErrorReport::warning(&core.component, e.to_string()));
                            core.soil.schedule(Utc::now() + chrono::Duration::milliseconds(SOIL_RETRY_MS));
                        }
                    }
                }
                changed = next_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Soil timer stopping");
                        break;
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}
