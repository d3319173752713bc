// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the work coordinator.
//!
//! One enum covers the store, the feeds, the item actions and the engine
//! lifecycle. The variants fall into the groups the coordination protocol
//! cares about:
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Conflict` | Yes | Optimistic-concurrency write rejected (benign) |
//! | `NotFound` | No | Document or revision does not exist |
//! | `TargetNotFound` | Yes | Item's backing database is gone (maybe deleted) |
//! | `Action` | Yes | Item-specific processing failed |
//! | `Database` | No | Local SQLite errors (needs operator attention) |
//! | `Redis` | Yes | Network errors, timeouts, connection failures |
//! | `Serialization` | No | Malformed item document |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `FeedClosed` | No | Continuous subscription ended unexpectedly |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Conflicts are expected under concurrent multi-worker operation and are
//! never surfaced past the operation that detected them. See
//! [`CoordinatorError::is_conflict()`].

use thiserror::Error;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors that can occur while coordinating work items.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A write was rejected because the document changed since it was read.
    ///
    /// Also returned for non-upserting updates of a document that no longer
    /// exists, and for creates of an id that already exists.
    #[error("Document update conflict ({id})")]
    Conflict { id: String },

    /// The document (or the given revision of it) does not exist.
    #[error("Document not found ({id})")]
    NotFound { id: String },

    /// The database an item points at could not be found.
    ///
    /// This may be a deletion or a transient visibility gap; the engine
    /// applies a staleness heuristic before destroying the item.
    #[error("Target not found: {target}")]
    TargetNotFound { target: String },

    /// The item-specific action failed.
    #[error("Action failed: {0}")]
    Action(String),

    /// SQLite error in the item or checkpoint store.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// An item document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// A continuous feed ended or failed.
    #[error("Feed closed: {0}")]
    FeedClosed(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Create a conflict error for a document id.
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Create a not-found error for a document id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a target-not-found error.
    pub fn target_not_found(target: impl Into<String>) -> Self {
        Self::TargetNotFound {
            target: target.into(),
        }
    }

    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this is a missing document or revision.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the item's backing target is missing.
    pub fn is_target_not_found(&self) -> bool {
        matches!(self, Self::TargetNotFound { .. })
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::TargetNotFound { .. } => true,
            Self::Action(_) => true,
            Self::Redis { .. } => true,
            Self::NotFound { .. } => false,
            Self::Database(_) => false,
            Self::Serialization(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::FeedClosed(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for CoordinatorError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}
