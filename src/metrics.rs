// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Item lock/process/unlock outcomes per item type
//! - Stalled-lock recovery and conflict cleanup
//! - Bulk dirtying rounds and soiling of delayed items
//! - Update batcher flushes and checkpoints
//! - Feed reconnects and SQLite contention
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `coordinator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use work_coordinator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_item_processed("replicator", "clean", Duration::from_millis(40));
//! metrics::record_dirty_pass("change_listener", 2, 10, 3);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Process Engine
// =============================================================================

/// Record a lock attempt (`acquired` false means another worker won).
pub fn record_lock_attempt(item_type: &str, acquired: bool) {
    let outcome = if acquired { "acquired" } else { "conflict" };
    counter!(
        "coordinator_lock_attempts_total",
        "item_type" => item_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record one processing attempt and how it ended.
///
/// Outcomes: `clean`, `redirty`, `error`, `destroyed`.
pub fn record_item_processed(item_type: &str, outcome: &str, duration: Duration) {
    let t = item_type.to_string();
    counter!(
        "coordinator_items_processed_total",
        "item_type" => t.clone(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("coordinator_process_duration_seconds", "item_type" => t).record(duration.as_secs_f64());
}

/// Record an unlock that lost its conditional write and fell back to upsert.
pub fn record_unlock_fallback(item_type: &str) {
    counter!("coordinator_unlock_fallbacks_total", "item_type" => item_type.to_string()).increment(1);
}

/// Record conflicting sibling revisions destroyed.
pub fn record_conflicts_resolved(item_type: &str, count: usize) {
    if count > 0 {
        counter!("coordinator_conflicts_resolved_total", "item_type" => item_type.to_string())
            .increment(count as u64);
    }
}

/// Record stalled locks swept back into the queue.
pub fn record_stalled_recovered(item_type: &str, count: usize) {
    counter!("coordinator_stall_sweeps_total", "item_type" => item_type.to_string()).increment(1);
    if count > 0 {
        counter!("coordinator_stalled_recovered_total", "item_type" => item_type.to_string())
            .increment(count as u64);
    }
}

/// Gauge for items currently being processed.
pub fn set_in_flight(item_type: &str, count: usize) {
    gauge!("coordinator_in_flight", "item_type" => item_type.to_string()).set(count as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(item_type: &str, state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("coordinator_engine_state", "item_type" => item_type.to_string()).set(value);
}

// =============================================================================
// Bulk Dirtying
// =============================================================================

/// Record one bulk-write round of the dirtying protocol.
pub fn record_dirty_round(item_type: &str, written: usize, conflicts: usize) {
    let t = item_type.to_string();
    counter!("coordinator_dirty_rounds_total", "item_type" => t.clone()).increment(1);
    counter!("coordinator_dirty_writes_total", "item_type" => t.clone()).increment(written as u64);
    if conflicts > 0 {
        counter!("coordinator_dirty_conflicts_total", "item_type" => t).increment(conflicts as u64);
    }
}

/// Record a completed dirtying pass.
pub fn record_dirty_pass(item_type: &str, rounds: usize, dirtied: usize, created: usize) {
    let t = item_type.to_string();
    histogram!("coordinator_dirty_pass_rounds", "item_type" => t.clone()).record(rounds as f64);
    counter!("coordinator_items_dirtied_total", "item_type" => t.clone()).increment(dirtied as u64);
    counter!("coordinator_items_created_total", "item_type" => t).increment(created as u64);
}

/// Record delayed items that became due and were soiled.
pub fn record_soiled(item_type: &str, count: usize) {
    counter!("coordinator_soil_passes_total", "item_type" => item_type.to_string()).increment(1);
    if count > 0 {
        counter!("coordinator_items_soiled_total", "item_type" => item_type.to_string())
            .increment(count as u64);
    }
}

// =============================================================================
// Update Batcher
// =============================================================================

/// Record global update events consumed by the batcher.
pub fn record_update_events(received: usize, excluded: usize) {
    counter!("coordinator_update_events_total").increment(received as u64);
    if excluded > 0 {
        counter!("coordinator_update_events_excluded_total").increment(excluded as u64);
    }
}

/// Record a batcher flush.
pub fn record_batch_flush(keys: usize, listeners: usize, duration: Duration) {
    counter!("coordinator_batch_flushes_total").increment(1);
    histogram!("coordinator_batch_keys").record(keys as f64);
    histogram!("coordinator_batch_listener_keys").record(listeners as f64);
    histogram!("coordinator_batch_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record a persisted batcher checkpoint.
pub fn record_checkpoint_saved(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("coordinator_checkpoint_saves_total", "status" => status).increment(1);
}

// =============================================================================
// Feeds and storage
// =============================================================================

/// Record a feed reconnect attempt.
pub fn record_feed_reconnect(feed: &str) {
    counter!("coordinator_feed_reconnects_total", "feed" => feed.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn sqlite_retries_total(operation: &str) {
    counter!("coordinator_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record errors by component and type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "coordinator_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
