// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Work Coordinator
//!
//! Lock/process/unlock work coordination for stateless workers that share
//! nothing but a document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                             work-coordinator                               │
//! │                                                                            │
//! │  ┌──────────────┐    ┌───────────────┐    ┌─────────────────────────────┐  │
//! │  │ UpdatesFeed  │───►│ UpdateBatcher │───►│ BulkDirtier (per item type) │  │
//! │  │ (db updates) │    │ (touched set) │    │ mark / create dirty items   │  │
//! │  └──────────────┘    └───────────────┘    └─────────────────────────────┘  │
//! │                             │                          │                   │
//! │                             ▼                          ▼                   │
//! │                    ┌─────────────────┐      ┌─────────────────────┐        │
//! │                    │ CheckpointStore │      │ ItemStore (dirty_T) │        │
//! │                    └─────────────────┘      └─────────────────────┘        │
//! │                                                        │                   │
//! │                                                        ▼                   │
//! │                          ┌──────────────────────────────────────────────┐  │
//! │                          │ ProcessEngine: lock ─► ItemAction ─► unlock  │  │
//! │                          │ + stall recovery + soil timer                │  │
//! │                          └──────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write to the store is an optimistic-concurrency write. Any number
//! of engines for the same item type may run in different processes; the
//! revision check, not an in-process lock, decides who owns an item.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use work_coordinator::{
//!     CoordinatorConfig, MatchAll, MemoryCheckpointStore, MemoryItemStore,
//!     MemoryUpdatesFeed, ProcessEngine, UpdateBatcher,
//! };
//! # use work_coordinator::ItemAction;
//!
//! # async fn run(replicate: Arc<dyn ItemAction>, listen: Arc<dyn ItemAction>) -> work_coordinator::Result<()> {
//! let config = CoordinatorConfig::default();
//! let store = Arc::new(MemoryItemStore::new());
//!
//! let replicators = ProcessEngine::new(store.clone(), replicate, config.engine.clone());
//! let listeners = ProcessEngine::new(store.clone(), listen, config.engine.clone());
//!
//! let batcher = UpdateBatcher::new(
//!     Arc::new(MemoryUpdatesFeed::new()),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(replicators.dirtier()),
//!     Arc::new(listeners.dirtier()),
//!     Arc::new(MatchAll),
//!     config.batcher.clone(),
//! );
//!
//! replicators.start().await?;
//! listeners.start().await?;
//! batcher.start().await?;
//!
//! // ...
//!
//! batcher.stop().await;
//! listeners.stop().await;
//! replicators.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod checkpoint;
pub mod config;
mod db;
pub mod dirtying;
pub mod engine;
pub mod error;
pub mod feed;
pub mod item;
pub mod kinds;
pub mod matcher;
pub mod metrics;
pub mod report;
pub mod resilience;
pub mod store;
pub mod updates;

// Re-exports for convenience
pub use batcher::{FlushReport, UpdateBatcher};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{
    BatcherConfig, CheckpointConfig, CoordinatorConfig, EngineConfig, StoreConfig, UpdatesFeedConfig,
};
pub use dirtying::{BulkDirtier, Dirtier, DirtyReport, SoilScheduler};
pub use engine::{EngineState, ItemAction, ProcessEngine, ProcessOutcome};
pub use error::{CoordinatorError, Result};
pub use feed::FeedSubscription;
pub use item::{ChangeListenerState, Item, ItemType, ReplicatorSpec};
pub use kinds::{ChangeListenerAction, ReplicatorAction};
pub use matcher::{InterestMatcher, MatchAll, PatternMatcher};
pub use report::{ChannelReporter, ErrorReport, ErrorReporter, LogReporter};
pub use store::{ItemStore, MemoryItemStore, SqliteItemStore, View};
pub use updates::{DbUpdate, MemoryUpdatesFeed, RedisUpdatesFeed, UpdateKind, UpdatesFeed};
