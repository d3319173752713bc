// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use super::{DbUpdate, UpdateKind, UpdatesFeed};
use crate::feed::{FeedSink, FeedSubscription};

/// In-process updates feed.
///
/// Sequences are decimal positions in the log starting at `1`.
#[derive(Clone)]
pub struct MemoryUpdatesFeed {
    log: Arc<Mutex<Vec<DbUpdate>>>,
    head: Arc<watch::Sender<u64>>,
}

impl Default for MemoryUpdatesFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUpdatesFeed {
    pub fn new() -> Self {
        let (head, _) = watch::channel(0);
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            head: Arc::new(head),
        }
    }

    /// Append a notification and return its sequence.
    pub async fn publish(&self, db_name: &str, kind: UpdateKind) -> String {
        let seq = {
            let mut log = self.log.lock().await;
            let seq = log.len() as u64 + 1;
            log.push(DbUpdate {
                seq: seq.to_string(),
                db_name: db_name.to_string(),
                kind,
            });
            seq
        };
        self.head.send_replace(seq);
        seq.to_string()
    }

    /// Sequence of the newest notification (`0` when empty).
    pub async fn head(&self) -> u64 {
        self.log.lock().await.len() as u64
    }
}

impl UpdatesFeed for MemoryUpdatesFeed {
    fn subscribe(&self, since: Option<String>) -> FeedSubscription<DbUpdate> {
        let log = self.log.clone();
        let head_tx = self.head.clone();
        let mut head = self.head.subscribe();
        let mut cursor = match since {
            Some(s) => s.parse::<u64>().unwrap_or(0),
            None => *head.borrow_and_update(),
        };

        FeedSubscription::spawn(move |mut sink: FeedSink<DbUpdate>| async move {
            // Keeps the head alive for as long as the producer runs
            let _head_tx = head_tx;

            loop {
                head.borrow_and_update();
                let pending: Vec<DbUpdate> = {
                    let log = log.lock().await;
                    let start = (cursor as usize).min(log.len());
                    log[start..].to_vec()
                };

                for update in pending {
                    cursor = update.seq.parse().unwrap_or(cursor + 1);
                    if !sink.send(Ok(update)).await {
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
