//! End-to-end synchronization flows against the in-memory store.

use driftsync_core::{
    CollectionSync, KeyValueStore, MemoryKeyValue, RetryPolicy, StaticIdentity, SyncConfig,
    SyncError, WriteOp,
};
use driftsync_memstore::MemoryStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Todo {
    title: String,
    done: bool,
}

fn todo(title: &str) -> Todo {
    Todo {
        title: title.to_string(),
        done: false,
    }
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::new("todos");
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(20),
    };
    config
}

fn sync_for(
    store: Arc<MemoryStore>,
    kv: Arc<dyn KeyValueStore>,
    owner: &str,
) -> CollectionSync<Todo> {
    CollectionSync::new(
        store,
        Arc::new(StaticIdentity::signed_in(owner)),
        kv,
        config(),
    )
}

#[tokio::test]
async fn create_fetch_update_remove_roundtrip() {
    let store = MemoryStore::new_shared();
    let sync = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "alice");

    let created = sync.create(todo("write tests")).await.unwrap();
    assert_eq!(created.metadata.owner_id, "alice");
    assert_eq!(sync.items().len(), 1);

    let fetched = sync.fetch().await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].payload, todo("write tests"));

    let updated = sync.update(&created.id, json!({"done": true})).await.unwrap();
    assert!(updated.payload.done);
    assert_eq!(updated.payload.title, "write tests");
    assert_eq!(store.get_raw("todos", &created.id).unwrap().payload["done"], true);

    sync.remove(&created.id).await.unwrap();
    assert!(sync.items().is_empty());
    assert!(sync.fetch().await.is_empty());

    // The store keeps a tombstone rather than purging.
    let raw = store.get_raw("todos", &created.id).unwrap();
    assert!(raw.metadata.deleted);
}

#[tokio::test]
async fn owners_see_only_their_records() {
    let store = MemoryStore::new_shared();
    let alice = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "alice");
    let bob = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "bob");

    alice.create(todo("alice's")).await.unwrap();
    bob.create(todo("bob's")).await.unwrap();

    let mine = alice.fetch().await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].payload.title, "alice's");
}

#[tokio::test]
async fn batch_shares_one_timestamp_for_creates() {
    let store = MemoryStore::new_shared();
    let sync = sync_for(store, Arc::new(MemoryKeyValue::new()), "alice");

    let items = sync
        .batch_update(vec![
            WriteOp::Create { payload: todo("a") },
            WriteOp::Create { payload: todo("b") },
            WriteOp::Create { payload: todo("c") },
        ])
        .await
        .unwrap();

    assert_eq!(items.len(), 3);
    let first = items[0].metadata.created_at;
    assert!(items.iter().all(|r| r.metadata.created_at == first));
}

#[tokio::test]
async fn mirror_hydrates_a_fresh_synchronizer() {
    let store = MemoryStore::new_shared();
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValue::new());

    let first = sync_for(Arc::clone(&store), Arc::clone(&kv), "alice");
    first.create(todo("persisted")).await.unwrap();

    // A second synchronizer over the same mirror namespace starts with the
    // mirrored items before any network traffic.
    let second = sync_for(Arc::clone(&store), kv, "alice");
    let state = second.state();
    assert_eq!(state.items.len(), 1);
    assert_eq!(state.items[0].payload.title, "persisted");
    assert!(state.from_cache);
    assert!(state.last_sync.is_none());

    // The first fetch confirms remotely and clears the cache flag.
    second.fetch().await;
    let state = second.state();
    assert!(!state.from_cache);
    assert!(state.last_sync.is_some());
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = MemoryStore::new_shared();
    let sync = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "alice");
    sync.create(todo("survives")).await.unwrap();

    store.inject_failures(vec![
        SyncError::Network("blip 1".into()),
        SyncError::Network("blip 2".into()),
    ]);

    // Two failures, third attempt succeeds.
    let items = sync.fetch().await;
    assert_eq!(items.len(), 1);
    assert!(sync.state().error.is_none());
}

#[tokio::test]
async fn exhausted_retries_keep_stale_items_and_flag_the_error() {
    let store = MemoryStore::new_shared();
    let sync = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "alice");
    sync.create(todo("stale but visible")).await.unwrap();
    sync.fetch().await;

    store.inject_failures(vec![
        SyncError::Network("down".into()),
        SyncError::Network("down".into()),
        SyncError::Network("down".into()),
    ]);

    let items = sync.fetch().await;
    assert_eq!(items.len(), 1);
    assert!(matches!(sync.state().error, Some(SyncError::Network(_))));

    // Recovery on the next fetch clears the error.
    let items = sync.fetch().await;
    assert_eq!(items.len(), 1);
    assert!(sync.state().error.is_none());
}

#[tokio::test]
async fn terminal_store_failures_are_not_retried() {
    let store = MemoryStore::new_shared();
    let sync = sync_for(Arc::clone(&store), Arc::new(MemoryKeyValue::new()), "alice");

    store.inject_failure(SyncError::PermissionDenied("writes disabled".into()));
    let result = sync.create(todo("rejected")).await;
    assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
    assert!(sync.items().is_empty());
    // The single injected failure consumed exactly one attempt.
    assert_eq!(store.record_count("todos"), 0);
}
