// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error reporting channel.
//!
//! Components never swallow a failure silently: per-item processing errors
//! and feed failures are handed to an [`ErrorReporter`] injected at
//! construction. A `fatal` report means the reporting component has stopped
//! its loops; whether the process exits is up to the embedding binary.

use tokio::sync::mpsc;
use tracing::{error, warn};

/// A failure surfaced by the engine or the batcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    /// Reporting component, e.g. `engine:replicator` or `batcher`.
    pub component: String,
    pub item_id: Option<String>,
    pub message: String,
    pub fatal: bool,
}

impl ErrorReport {
    pub fn item(component: impl Into<String>, item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            item_id: Some(item_id.into()),
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            item_id: None,
            message: message.into(),
            fatal: true,
        }
    }

    pub fn warning(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            item_id: None,
            message: message.into(),
            fatal: false,
        }
    }
}

/// Sink for [`ErrorReport`]s.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, report: ErrorReport);
}

/// Emits reports as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, report: ErrorReport) {
        let item_id = report.item_id.as_deref().unwrap_or("-");
        if report.fatal {
            error!(
                component = %report.component,
                item_id = %item_id,
                error = %report.message,
                "Fatal failure, component stopped"
            );
        } else {
            warn!(
                component = %report.component,
                item_id = %item_id,
                error = %report.message,
                "Processing failure"
            );
        }
    }
}

/// Forwards reports into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ErrorReport>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorReporter for ChannelReporter {
    fn report(&self, report: ErrorReport) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_reporter_forwards() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.report(ErrorReport::item("engine:replicator", "r1", "boom"));
        reporter.report(ErrorReport::fatal("batcher", "stream closed"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.item_id.as_deref(), Some("r1"));
        assert!(!first.fatal);

        let second = rx.recv().await.unwrap();
        assert!(second.fatal);
        assert_eq!(second.component, "batcher");
    }

    #[test]
    fn test_channel_reporter_without_receiver() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);
        reporter.report(ErrorReport::warning("batcher", "ignored"));
    }

    #[test]
    fn test_log_reporter() {
        LogReporter.report(ErrorReport::item("engine:change_listener", "c1", "boom"));
        LogReporter.report(ErrorReport::fatal("engine:change_listener", "feed"));
    }
}
