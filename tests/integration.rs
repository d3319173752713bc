// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Work Coordinator
//!
//! SQLite-backed tests run everywhere. Redis tests use testcontainers and
//! are ignored by default.
//!
//! # Running Tests
//! ```bash
//! # Run the Redis tests too (requires Docker / OrbStack)
//! cargo test --test integration -- --include-ignored
//!
//! # Run specific group
//! cargo test --test integration pipeline_
//! ```
//!
//! # Test Organization
//! - `pipeline_*` - batcher → dirtying → engines, end to end
//! - `sqlite_*` - engines on a shared SQLite item store
//! - `checkpoint_*` - batcher checkpoint persistence across restarts
//! - `redis_*` - Redis stream updates feed

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    wait_until, CollectingDispatcher, CountingAction, FakeReplication, FakeSource, RecordingDirtier, TestRedis,
};
use tempfile::tempdir;
use testcontainers::clients::Cli;
use work_coordinator::resilience::RetryConfig;
use work_coordinator::{
    BatcherConfig, ChangeListenerAction, CheckpointStore, DbUpdate, EngineConfig, EngineState, Item, ItemStore,
    ItemType, MatchAll, MemoryCheckpointStore, MemoryItemStore, MemoryUpdatesFeed, PatternMatcher, ProcessEngine,
    RedisUpdatesFeed, ReplicatorAction, SqliteCheckpointStore, SqliteItemStore, UpdateBatcher, UpdateKind,
    UpdatesFeed, UpdatesFeedConfig,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn open_sqlite(path: &std::path::Path) -> Arc<SqliteItemStore> {
    Arc::new(
        SqliteItemStore::open(path, Duration::from_millis(20))
            .await
            .expect("open item store"),
    )
}

async fn is_clean(store: &dyn ItemStore, id: &str) -> bool {
    matches!(
        store.get(id).await,
        Ok(Some(item)) if item.is_clean() && !item.is_locked()
    )
}

// =============================================================================
// End-to-end pipeline
// =============================================================================

#[tokio::test]
async fn pipeline_update_reaches_both_item_kinds() {
    init_tracing();
    let store = Arc::new(MemoryItemStore::new());
    let replication = FakeReplication::new();
    let source = FakeSource::new();
    let dispatcher = CollectingDispatcher::new();
    source.write("users", 3);

    // A user-defined replicator out of "users", currently clean
    let mut replicator = Item::replicator("http://db:5984/users", "http://backup:5984/users");
    replicator.dirty = Some(false);
    let replicator = store.create(&replicator).await.unwrap();

    let replicators = ProcessEngine::new(
        store.clone(),
        Arc::new(ReplicatorAction::new(replication.clone())),
        EngineConfig::for_testing(),
    );
    let listeners = ProcessEngine::new(
        store.clone(),
        Arc::new(ChangeListenerAction::new(source.clone(), dispatcher.clone())),
        EngineConfig::for_testing(),
    );
    let feed = MemoryUpdatesFeed::new();
    let batcher = UpdateBatcher::new(
        Arc::new(feed.clone()),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(replicators.dirtier()),
        Arc::new(listeners.dirtier()),
        Arc::new(MatchAll),
        BatcherConfig::for_testing(),
    );

    replicators.start().await.unwrap();
    listeners.start().await.unwrap();
    batcher.start().await.unwrap();

    feed.publish("users", UpdateKind::Updated).await;
    feed.publish("users", UpdateKind::Updated).await;

    assert!(wait_until(WAIT, || async { dispatcher.seen("users").len() == 3 }).await);
    assert!(wait_until(WAIT, || async { !replication.runs().is_empty() }).await);
    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), "change_listener_users").await }).await);
    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), &replicator.id).await }).await);

    let listener = store.get("change_listener_users").await.unwrap().unwrap();
    assert_eq!(listener.payload_str("last_seq"), Some("3"));
    assert_eq!(
        replication.runs()[0],
        ("http://db:5984/users".to_string(), "http://backup:5984/users".to_string())
    );

    batcher.stop().await;
    listeners.stop().await;
    replicators.stop().await;
}

#[tokio::test]
async fn pipeline_uninteresting_databases_get_no_listener() {
    let store = Arc::new(MemoryItemStore::new());
    let source = FakeSource::new();
    source.write("users", 1);
    source.write("logs", 1);

    let listeners = ProcessEngine::new(
        store.clone(),
        Arc::new(ChangeListenerAction::new(source.clone(), CollectingDispatcher::new())),
        EngineConfig::for_testing(),
    );
    let replicators = RecordingDirtier::new();
    let feed = MemoryUpdatesFeed::new();
    let batcher = UpdateBatcher::new(
        Arc::new(feed.clone()),
        Arc::new(MemoryCheckpointStore::new()),
        replicators.clone(),
        Arc::new(listeners.dirtier()),
        Arc::new(PatternMatcher::new(["users"]).unwrap()),
        BatcherConfig::for_testing(),
    );
    listeners.start().await.unwrap();
    batcher.start().await.unwrap();

    feed.publish("users", UpdateKind::Created).await;
    feed.publish("logs", UpdateKind::Created).await;

    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), "change_listener_users").await }).await);
    assert!(store.get("change_listener_logs").await.unwrap().is_none());
    assert_eq!(replicators.calls().concat().len(), 2);

    batcher.stop().await;
    listeners.stop().await;
}

#[tokio::test]
async fn pipeline_dropped_database_listener_is_destroyed() {
    let store = Arc::new(MemoryItemStore::new());
    let source = FakeSource::new();

    // Listener last touched long ago; its database is gone
    let mut listener = Item::change_listener("archive");
    listener.dirty = Some(true);
    listener.touch(chrono::Utc::now() - chrono::Duration::hours(2));
    store.create(&listener).await.unwrap();

    let engine = ProcessEngine::new(
        store.clone(),
        Arc::new(ChangeListenerAction::new(source, CollectingDispatcher::new())),
        EngineConfig::for_testing(),
    );
    engine.start().await.unwrap();

    assert!(store.get("change_listener_archive").await.unwrap().is_none());
    engine.stop().await;
}

// =============================================================================
// SQLite item store
// =============================================================================

#[tokio::test]
async fn sqlite_engine_processes_existing_and_new_items() {
    let dir = tempdir().unwrap();
    let store = open_sqlite(&dir.path().join("items.db")).await;
    let action = CountingAction::new(ItemType::ChangeListener);

    for db in ["a", "b", "c"] {
        store.create(&Item::change_listener(db)).await.unwrap();
    }

    let engine = ProcessEngine::new(store.clone(), action.clone(), EngineConfig::for_testing());
    engine.start().await.unwrap();
    assert_eq!(action.total(), 3);

    engine
        .dirtier()
        .run(vec!["a".into(), "d".into()], None)
        .await
        .unwrap();
    assert!(wait_until(WAIT, || async { action.count("change_listener_d") == 1 }).await);
    assert!(wait_until(WAIT, || async { action.count("change_listener_a") == 2 }).await);
    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), "change_listener_a").await }).await);

    engine.stop().await;
    store.close().await;
}

/// Insert a listener row whose body is not a valid item, the way a foreign
/// writer or an older schema could leave it.
async fn insert_broken_listener(path: &std::path::Path, db: &str) {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let id = format!("change_listener_{}", db);
    sqlx::query(
        "INSERT INTO items (id, rev, generation, item_type, target_key, dirty, locked, body) \
         VALUES (?, '1-bad', 1, 'change_listener', ?, 1, 0, '{\"dirty\":\"yes\"}')",
    )
    .bind(&id)
    .bind(db)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO item_changes (id) VALUES (?)")
        .bind(&id)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

#[tokio::test]
async fn sqlite_undecodable_item_does_not_fail_engine() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("items.db");
    let store = open_sqlite(&path).await;
    store.ensure_views(ItemType::ChangeListener).await.unwrap();

    insert_broken_listener(&path, "broken").await;
    store.create(&Item::change_listener("good")).await.unwrap();

    let action = CountingAction::new(ItemType::ChangeListener);
    let engine = ProcessEngine::new(store.clone(), action.clone(), EngineConfig::for_testing());
    engine.start().await.unwrap();
    assert!(engine.is_running());
    assert_eq!(action.count("change_listener_good"), 1);

    // A bad row arriving through the feed is skipped as well
    insert_broken_listener(&path, "broken_late").await;
    store.create(&Item::change_listener("late")).await.unwrap();
    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), "change_listener_late").await }).await);
    assert_eq!(engine.state(), EngineState::Running);
    assert_eq!(action.count("change_listener_broken"), 0);

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    store.close().await;
}

#[tokio::test]
async fn sqlite_two_workers_share_one_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("items.db");
    // Two handles on one file, as two worker processes would have
    let store_a = open_sqlite(&path).await;
    let store_b = open_sqlite(&path).await;
    store_a.ensure_views(ItemType::ChangeListener).await.unwrap();

    let action_a = CountingAction::with_delay(ItemType::ChangeListener, Duration::from_millis(5));
    let action_b = CountingAction::with_delay(ItemType::ChangeListener, Duration::from_millis(5));
    let engine_a = ProcessEngine::new(store_a.clone(), action_a.clone(), EngineConfig::for_testing());
    let engine_b = ProcessEngine::new(store_b.clone(), action_b.clone(), EngineConfig::for_testing());
    engine_a.start().await.unwrap();
    engine_b.start().await.unwrap();

    let keys: Vec<String> = (0..20).map(|i| format!("db{}", i)).collect();
    engine_a.dirtier().run(keys.clone(), None).await.unwrap();

    for key in &keys {
        let id = format!("change_listener_{}", key);
        assert!(
            wait_until(WAIT, || async { is_clean(store_b.as_ref(), &id).await }).await,
            "{} never processed",
            id
        );
        assert!(action_a.count(&id) + action_b.count(&id) >= 1);
    }

    engine_a.stop().await;
    engine_b.stop().await;
    store_a.close().await;
    store_b.close().await;
}

#[tokio::test]
async fn sqlite_replicated_conflict_is_resolved() {
    let dir = tempdir().unwrap();
    let store = open_sqlite(&dir.path().join("items.db")).await;
    let action = CountingAction::new(ItemType::ChangeListener);

    let mut item = Item::change_listener("split");
    item.dirty = Some(false);
    store.create(&item).await.unwrap();

    let engine = ProcessEngine::new(store.clone(), action.clone(), EngineConfig::for_testing());
    engine.start().await.unwrap();

    let mut sibling = Item::change_listener("split");
    sibling.dirty = Some(true);
    store.insert_conflict("change_listener_split", &sibling).await.unwrap();

    assert!(
        wait_until(WAIT, || async {
            matches!(
                store.get("change_listener_split").await,
                Ok(Some(item)) if !item.has_conflicts()
            )
        })
        .await
    );
    engine.stop().await;
    store.close().await;
}

#[tokio::test]
async fn sqlite_stalled_lock_is_recovered() {
    let dir = tempdir().unwrap();
    let store = open_sqlite(&dir.path().join("items.db")).await;
    let action = CountingAction::new(ItemType::ChangeListener);

    // Locked by a worker that crashed a while ago
    let mut item = Item::change_listener("stuck");
    item.dirty = Some(true);
    item.locked_at = Some(chrono::Utc::now() - chrono::Duration::minutes(30));
    store.create(&item).await.unwrap();

    let engine = ProcessEngine::new(store.clone(), action.clone(), EngineConfig::for_testing());
    engine.start().await.unwrap();
    assert_eq!(action.total(), 0);

    assert!(wait_until(WAIT, || async { action.count("change_listener_stuck") == 1 }).await);
    assert!(wait_until(WAIT, || async { is_clean(store.as_ref(), "change_listener_stuck").await }).await);
    engine.stop().await;
    store.close().await;
}

// =============================================================================
// Checkpoints
// =============================================================================

#[tokio::test]
async fn checkpoint_survives_batcher_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let feed = MemoryUpdatesFeed::new();
    let replicators = RecordingDirtier::new();
    let listeners = RecordingDirtier::new();

    let make = |checkpoints: Arc<SqliteCheckpointStore>| {
        UpdateBatcher::new(
            Arc::new(feed.clone()),
            checkpoints,
            replicators.clone(),
            listeners.clone(),
            Arc::new(MatchAll),
            BatcherConfig::for_testing(),
        )
    };

    let checkpoints = Arc::new(SqliteCheckpointStore::new(&path).await.unwrap());
    let first = make(checkpoints.clone());
    first.start().await.unwrap();
    feed.publish("a", UpdateKind::Updated).await;
    assert!(wait_until(WAIT, || async { replicators.calls().len() == 1 }).await);
    first.stop().await;
    checkpoints.close().await;

    feed.publish("b", UpdateKind::Updated).await;

    let checkpoints = Arc::new(SqliteCheckpointStore::new(&path).await.unwrap());
    assert_eq!(
        checkpoints.get("update_batcher_last_seq").await.unwrap().as_deref(),
        Some("1")
    );
    let second = make(checkpoints.clone());
    second.start().await.unwrap();
    assert!(wait_until(WAIT, || async { replicators.calls().len() == 2 }).await);
    assert_eq!(replicators.calls(), vec![vec!["a".to_string()], vec!["b".to_string()]]);
    assert_eq!(second.state(), EngineState::Running);

    second.stop().await;
    checkpoints.close().await;
}

// =============================================================================
// Redis updates feed
// =============================================================================

fn redis_config(url: &str) -> UpdatesFeedConfig {
    UpdatesFeedConfig {
        redis_url: url.to_string(),
        stream_key: "db_updates".into(),
        block_timeout: "100ms".into(),
        read_count: 100,
    }
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_feed_delivers_published_updates() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let feed = RedisUpdatesFeed::new(&redis_config(&redis.redis_url))
        .unwrap()
        .with_retry(RetryConfig::testing());

    let first = feed.publish("users", UpdateKind::Created).await.unwrap();
    let mut sub = feed.subscribe(Some("0".into()));
    let second = feed.publish("orders", UpdateKind::Deleted).await.unwrap();

    let a: DbUpdate = sub.next().await.unwrap().unwrap();
    let b: DbUpdate = sub.next().await.unwrap().unwrap();
    assert_eq!((a.seq.as_str(), a.db_name.as_str(), a.kind), (first.as_str(), "users", UpdateKind::Created));
    assert_eq!((b.seq.as_str(), b.db_name.as_str(), b.kind), (second.as_str(), "orders", UpdateKind::Deleted));
    sub.cancel();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_feed_skips_malformed_entries() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let feed = RedisUpdatesFeed::new(&redis_config(&redis.redis_url))
        .unwrap()
        .with_retry(RetryConfig::testing());

    redis.xadd_raw("db_updates", &[("type", "updated")]).await.unwrap();
    feed.publish("users", UpdateKind::Updated).await.unwrap();
    assert_eq!(redis.stream_len("db_updates").await.unwrap(), 2);

    let mut sub = feed.subscribe(Some("0".into()));
    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(update.db_name, "users");
    sub.cancel();
}

#[tokio::test]
#[ignore] // Requires Docker
async fn redis_batcher_resumes_after_checkpoint() {
    let docker = Cli::default();
    let redis = TestRedis::new(&docker);
    let feed = Arc::new(
        RedisUpdatesFeed::new(&redis_config(&redis.redis_url))
            .unwrap()
            .with_retry(RetryConfig::testing()),
    );
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let replicators = RecordingDirtier::new();

    let make = || {
        UpdateBatcher::new(
            feed.clone(),
            checkpoints.clone(),
            replicators.clone(),
            RecordingDirtier::new(),
            Arc::new(MatchAll),
            BatcherConfig::for_testing(),
        )
    };

    let first = make();
    first.start().await.unwrap();
    // Give XREAD a moment to anchor on the stream head
    tokio::time::sleep(Duration::from_millis(200)).await;
    feed.publish("a", UpdateKind::Updated).await.unwrap();
    assert!(wait_until(WAIT, || async { replicators.calls().len() == 1 }).await);
    first.stop().await;

    feed.publish("b", UpdateKind::Updated).await.unwrap();

    let second = make();
    second.start().await.unwrap();
    assert!(wait_until(WAIT, || async { replicators.calls().len() == 2 }).await);
    assert_eq!(replicators.calls()[1], vec!["b".to_string()]);
    second.stop().await;
}

#[tokio::test]
async fn redis_unreachable_feed_fails_batcher() {
    let feed = RedisUpdatesFeed::new(&redis_config("redis://127.0.0.1:1"))
        .unwrap()
        .with_retry(RetryConfig::testing());
    let (reporter, mut reports) = work_coordinator::ChannelReporter::new();
    let batcher = UpdateBatcher::new(
        Arc::new(feed),
        Arc::new(MemoryCheckpointStore::new()),
        RecordingDirtier::new(),
        RecordingDirtier::new(),
        Arc::new(MatchAll),
        BatcherConfig::for_testing(),
    )
    .with_reporter(Arc::new(reporter));

    batcher.start().await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), reports.recv())
        .await
        .expect("fatal report")
        .unwrap();
    assert!(report.fatal);
    batcher.stop().await;
    assert_eq!(batcher.state(), EngineState::Failed);
}
