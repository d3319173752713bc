// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis stream backend for the database-updates feed.
//!
//! Each stream entry is one notification with two fields:
//!
//! ```text
//! XADD db_updates * db_name users type updated
//! ```
//!
//! The stream entry id is the feed sequence. A subscription tails the
//! stream with `XREAD BLOCK`, resuming strictly after its cursor.
//!
//! # Failure Handling
//!
//! Read failures are retried with [`RetryConfig`] backoff, reusing the
//! multiplexed [`ConnectionManager`] (which reconnects on its own). Once the
//! retry budget is spent the subscription yields the error and ends; the
//! consumer decides whether that is fatal.
//!
//! Entries with a missing `db_name` are logged and skipped.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{DbUpdate, UpdateKind, UpdatesFeed};
use crate::config::UpdatesFeedConfig;
use crate::error::{CoordinatorError, Result};
use crate::feed::{FeedSink, FeedSubscription};
use crate::metrics;
use crate::resilience::RetryConfig;

/// Updates feed tailing a Redis stream.
#[derive(Clone)]
pub struct RedisUpdatesFeed {
    client: Client,
    stream_key: String,
    block_timeout: Duration,
    read_count: usize,
    retry: RetryConfig,
}

impl RedisUpdatesFeed {
    /// Create a feed from config. Does not connect yet.
    pub fn new(config: &UpdatesFeedConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| CoordinatorError::redis("open", e))?;
        Ok(Self {
            client,
            stream_key: config.stream_key.clone(),
            block_timeout: config.block_timeout_duration(),
            read_count: config.read_count.max(1),
            retry: RetryConfig::daemon(),
        })
    }

    /// Replace the reconnect schedule (tests use [`RetryConfig::testing()`]).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Open a connection manager, retrying per the configured schedule.
    pub async fn connect(&self) -> Result<ConnectionManager> {
        connect_with_retry(&self.client, &self.retry, &self.stream_key).await
    }

    /// Append a notification. Returns the stream entry id.
    pub async fn publish(&self, db_name: &str, kind: UpdateKind) -> Result<String> {
        let mut conn = self.connect().await?;
        let id: String = conn
            .xadd(
                &self.stream_key,
                "*",
                &[("db_name", db_name), ("type", kind.as_str())],
            )
            .await
            .map_err(|e| CoordinatorError::redis("XADD", e))?;
        trace!(stream = %self.stream_key, id = %id, db_name = %db_name, "Published update");
        Ok(id)
    }

    /// Id of the newest entry, `None` if the stream is empty or missing.
    pub async fn latest_id(&self, conn: &mut ConnectionManager) -> Result<Option<String>> {
        latest_id(conn, &self.stream_key).await
    }
}

impl UpdatesFeed for RedisUpdatesFeed {
    fn subscribe(&self, since: Option<String>) -> FeedSubscription<DbUpdate> {
        let feed = self.clone();
        FeedSubscription::spawn(move |sink| feed.tail(since, sink))
    }
}

impl RedisUpdatesFeed {
    async fn tail(self, since: Option<String>, mut sink: FeedSink<DbUpdate>) {
        let mut conn = tokio::select! {
            conn = self.connect() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    sink.send(Err(e)).await;
                    return;
                }
            },
            _ = sink.cancelled() => return,
        };

        let mut cursor = match since {
            Some(since) => since,
            None => match latest_id(&mut conn, &self.stream_key).await {
                Ok(id) => id.unwrap_or_else(|| "0".to_string()),
                Err(e) => {
                    sink.send(Err(e)).await;
                    return;
                }
            },
        };
        info!(stream = %self.stream_key, cursor = %cursor, "Tailing updates stream");

        let opts = StreamReadOptions::default()
            .block(self.block_timeout.as_millis() as usize)
            .count(self.read_count);
        let mut failures = 0usize;

        loop {
            let keys = [self.stream_key.as_str()];
            let ids = [cursor.as_str()];
            let read: redis::RedisResult<Option<StreamReadReply>> = tokio::select! {
                read = conn.xread_options(&keys, &ids, &opts) => read,
                _ = sink.cancelled() => return,
            };

            let reply = match read {
                Ok(reply) => {
                    failures = 0;
                    reply
                }
                Err(e) => {
                    failures += 1;
                    metrics::record_feed_reconnect(&self.stream_key);
                    if !self.retry.should_retry(failures) {
                        sink.send(Err(CoordinatorError::redis("XREAD", e))).await;
                        return;
                    }
                    let delay = self.retry.delay_for_attempt(failures);
                    warn!(
                        stream = %self.stream_key,
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Updates stream read failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = sink.cancelled() => return,
                    }
                }
            };

            let Some(reply) = reply else {
                // Block timeout with nothing new
                continue;
            };

            for key in reply.keys {
                for entry in key.ids {
                    cursor = entry.id.clone();
                    match parse_entry(&entry.id, &entry.map) {
                        Ok(update) => {
                            if !sink.send(Ok(update)).await {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(
                                stream = %self.stream_key,
                                stream_id = %entry.id,
                                error = %e,
                                "Failed to parse stream entry, skipping"
                            );
                        }
                    }
                }
            }
        }
    }
}

async fn connect_with_retry(
    client: &Client,
    retry: &RetryConfig,
    stream_key: &str,
) -> Result<ConnectionManager> {
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let error = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                if attempt > 1 {
                    info!(stream = %stream_key, attempt, "Connected to Redis after retry");
                } else {
                    debug!(stream = %stream_key, "Connected to Redis");
                }
                return Ok(conn);
            }
            Ok(Err(e)) => CoordinatorError::redis("connect", e),
            Err(_) => CoordinatorError::redis_msg(
                "connect",
                format!("timed out after {:?}", retry.connection_timeout),
            ),
        };

        metrics::record_feed_reconnect(stream_key);
        if !retry.should_retry(attempt) {
            return Err(error);
        }
        let delay = retry.delay_for_attempt(attempt);
        warn!(
            stream = %stream_key,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "Redis connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

async fn latest_id(conn: &mut ConnectionManager, stream_key: &str) -> Result<Option<String>> {
    // XREVRANGE key + - COUNT 1 returns the newest entry
    let result: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XREVRANGE")
        .arg(stream_key)
        .arg("+")
        .arg("-")
        .arg("COUNT")
        .arg(1)
        .query_async(conn)
        .await
        .map_err(|e| CoordinatorError::redis("XREVRANGE", e))?;

    Ok(result.first().map(|(id, _)| id.clone()))
}

fn parse_entry(stream_id: &str, fields: &HashMap<String, redis::Value>) -> Result<DbUpdate> {
    let db_name = get_string_field(fields, "db_name")?;
    let kind = get_string_field(fields, "type")
        .map(|t| UpdateKind::parse(&t))
        .unwrap_or(UpdateKind::Updated);
    Ok(DbUpdate {
        seq: stream_id.to_string(),
        db_name,
        kind,
    })
}

/// Extract a string field from a stream entry.
fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let value = fields
        .get(name)
        .ok_or_else(|| CoordinatorError::redis_msg("parse", format!("missing field: {}", name)))?;

    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).map_err(|e| {
            CoordinatorError::redis_msg("parse", format!("invalid UTF-8 in {}: {}", name, e))
        }),
        redis::Value::SimpleString(s) => Ok(s.clone()),
        _ => Err(CoordinatorError::redis_msg(
            "parse",
            format!("unexpected type for field {}: {:?}", name, value),
        )),
    }
}

/// Compare two Redis stream IDs numerically.
///
/// Stream IDs are formatted as `{timestamp}-{sequence}` (e.g., "1234567890123-0").
pub fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> (u64, u64) {
        match s.split_once('-') {
            Some((ts, seq)) => (ts.parse().unwrap_or(0), seq.parse().unwrap_or(0)),
            // "0" and other bare ids
            None => (s.parse().unwrap_or(0), 0),
        }
    };

    parse(a).cmp(&parse(b))
}
