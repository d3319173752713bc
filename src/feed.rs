// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cancelable continuous feeds.
//!
//! Both the item change feed and the global database-updates feed are
//! exposed as a [`FeedSubscription`]: a producer task pushes entries into a
//! bounded channel, the consumer pulls them with [`FeedSubscription::next()`]
//! and cancels with [`FeedSubscription::cancel()`] (or by dropping it).
//!
//! ```text
//! subscribe() ──▶ producer task ──mpsc──▶ next().await ──▶ consumer
//!                      ▲
//!                      └──── watch<bool> cancel ◀──── cancel()
//! ```
//!
//! The transport behind a subscription (polling a table, `XREAD BLOCK`,
//! an in-process log) is an implementation detail of the producer.

use std::future::Future;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default buffer between producer and consumer.
pub const DEFAULT_FEED_BUFFER: usize = 256;

/// Producer side of a subscription.
pub struct FeedSink<T> {
    tx: mpsc::Sender<Result<T>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<T: Send + 'static> FeedSink<T> {
    /// Push an entry. Returns `false` once the consumer is gone or cancelled.
    pub async fn send(&self, entry: Result<T>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.send(entry).await.is_ok()
    }

    /// Whether the consumer asked the producer to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow() || self.tx.is_closed()
    }

    /// Resolves once the subscription is cancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::select! {
                changed = self.cancel_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.tx.closed() => return,
            }
        }
    }
}

/// Consumer side of a continuous feed.
pub struct FeedSubscription<T> {
    rx: mpsc::Receiver<Result<T>>,
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> FeedSubscription<T> {
    /// Spawn `producer` and return the subscription reading from it.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(FeedSink<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with_buffer(DEFAULT_FEED_BUFFER, producer)
    }

    /// Like [`spawn()`](Self::spawn) with an explicit buffer size.
    pub fn spawn_with_buffer<F, Fut>(buffer: usize, producer: F) -> Self
    where
        F: FnOnce(FeedSink<T>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sink = FeedSink { tx, cancel_rx };
        let handle = tokio::spawn(producer(sink));
        Self {
            rx,
            cancel_tx,
            handle: Some(handle),
        }
    }

    /// Next entry, or `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    /// Stop the producer. Entries already buffered are discarded.
    pub fn cancel(&mut self) {
        let _ = self.cancel_tx.send(true);
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

impl<T> Drop for FeedSubscription<T> {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;

    #[tokio::test]
    async fn test_entries_arrive_in_order() {
        let mut sub = FeedSubscription::spawn(|sink: FeedSink<u32>| async move {
            for i in 0..5 {
                if !sink.send(Ok(i)).await {
                    return;
                }
            }
        });

        let mut seen = Vec::new();
        while let Some(entry) = sub.next().await {
            seen.push(entry.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let mut sub = FeedSubscription::spawn(|mut sink: FeedSink<u32>| async move {
            sink.cancelled().await;
        });

        sub.cancel();
        assert!(sub.is_cancelled());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_errors_are_delivered() {
        let mut sub = FeedSubscription::spawn(|sink: FeedSink<u32>| async move {
            sink.send(Ok(1)).await;
            sink.send(Err(CoordinatorError::FeedClosed("eof".into()))).await;
        });

        assert_eq!(sub.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            sub.next().await,
            Some(Err(CoordinatorError::FeedClosed(_)))
        ));
        assert!(sub.next().await.is_none());
    }
}
