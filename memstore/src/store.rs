//! The in-memory document store.

use async_trait::async_trait;
use dashmap::DashMap;
use driftsync_core::error::{Result, SyncError};
use driftsync_core::store::{
    merge_changes, BatchEntry, Payload, QueryFilter, RemoteStore, Snapshot, Subscription,
    SubscriptionEvent,
};
use driftsync_core::{now_millis, CollectionName, Metadata, Record, RecordId};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

type Collection = DashMap<RecordId, Record<Value>>;

/// What a subscriber receives on each delivery, before payload typing.
enum PushPayload {
    Snapshot(Vec<Record<Value>>),
    Error(SyncError),
}

/// Returns false once the receiving side is gone.
type PushFn = Box<dyn Fn(PushPayload) -> bool + Send + Sync>;

struct SubscriberEntry {
    collection: CollectionName,
    filter: QueryFilter,
    push: PushFn,
}

/// An in-memory [`RemoteStore`] holding collections of JSON documents.
///
/// Documents are stored untyped; each [`RemoteStore<T>`] call encodes or
/// decodes at the boundary, so differently typed synchronizers can share one
/// store. Push subscriptions receive a full filtered snapshot immediately on
/// subscribe and after every committed write to their collection.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<CollectionName, Collection>,
    subscribers: DashMap<u64, SubscriberEntry>,
    next_subscription: AtomicU64,
    failures: Mutex<VecDeque<SyncError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Script the next store call to fail with the given error. Injected
    /// failures are consumed in order, one per call.
    pub fn inject_failure(&self, err: SyncError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Script several failures at once.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = SyncError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    /// Deliver a stream error to every live subscriber.
    pub fn emit_subscription_error(&self, err: SyncError) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !(entry.push)(PushPayload::Error(err.clone())) {
                dead.push(*entry.key());
            }
        }
        self.prune(dead);
    }

    /// Raw stored record, tombstones included.
    pub fn get_raw(&self, collection: &str, id: &str) -> Option<Record<Value>> {
        self.collections
            .get(collection)
            .and_then(|coll| coll.get(id).map(|r| r.clone()))
    }

    /// Number of stored records in a collection, tombstones included.
    pub fn record_count(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn check_failure(&self) -> Result<()> {
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Filtered records in the store's canonical ordering (creation time,
    /// then id for records created in the same millisecond).
    fn snapshot_for(&self, collection: &str, filter: &QueryFilter) -> Vec<Record<Value>> {
        let mut records: Vec<Record<Value>> = self
            .collections
            .get(collection)
            .map(|coll| {
                coll.iter()
                    .filter(|r| filter.matches(&r.metadata))
                    .map(|r| r.clone())
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// Deliver a fresh snapshot to every subscriber of `collection`,
    /// pruning subscriptions whose receiver has been dropped.
    fn notify(&self, collection: &str) {
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.collection != collection {
                continue;
            }
            let snapshot = self.snapshot_for(collection, &entry.filter);
            if !(entry.push)(PushPayload::Snapshot(snapshot)) {
                dead.push(*entry.key());
            }
        }
        self.prune(dead);
    }

    fn prune(&self, dead: Vec<u64>) {
        for id in dead {
            self.subscribers.remove(&id);
            tracing::debug!(subscription = id, "pruned closed subscription");
        }
    }
}

fn decode_record<T: Payload>(record: Record<Value>) -> Result<Record<T>> {
    let payload: T = serde_json::from_value(record.payload)?;
    Ok(Record::new(record.id, payload, record.metadata))
}

#[async_trait]
impl<T: Payload> RemoteStore<T> for MemoryStore {
    async fn query(&self, collection: &str, filter: &QueryFilter) -> Result<Vec<Record<T>>> {
        self.check_failure()?;
        self.snapshot_for(collection, filter)
            .into_iter()
            .map(decode_record)
            .collect()
    }

    async fn insert(&self, collection: &str, payload: T, metadata: Metadata) -> Result<RecordId> {
        self.check_failure()?;
        let value = serde_json::to_value(&payload)?;
        let id = Uuid::new_v4().to_string();
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), Record::new(id.clone(), value, metadata));
        tracing::debug!(collection, id = %id, "inserted record");
        self.notify(collection);
        Ok(id)
    }

    async fn patch(&self, collection: &str, id: &str, changes: Value) -> Result<()> {
        self.check_failure()?;
        {
            let coll = self
                .collections
                .get(collection)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            let mut record = coll
                .get_mut(id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            if record.metadata.deleted {
                return Err(SyncError::NotFound(id.to_string()));
            }
            merge_changes(&mut record.payload, &changes)?;
            record.metadata.touch(now_millis());
        }
        tracing::debug!(collection, id, "patched record");
        self.notify(collection);
        Ok(())
    }

    async fn soft_delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_failure()?;
        let already_deleted = {
            let coll = self
                .collections
                .get(collection)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            let mut record = coll
                .get_mut(id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
            if record.metadata.deleted {
                true
            } else {
                record.metadata.mark_deleted(now_millis());
                false
            }
        };
        if !already_deleted {
            tracing::debug!(collection, id, "soft-deleted record");
            self.notify(collection);
        }
        Ok(())
    }

    async fn batch_write(&self, collection: &str, entries: Vec<BatchEntry<T>>) -> Result<()> {
        self.check_failure()?;
        {
            let coll = self.collections.entry(collection.to_string()).or_default();

            // Stage every entry against a copy; commit only if all apply.
            let mut staged: HashMap<RecordId, Record<Value>> = coll
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect();
            let now = now_millis();
            for entry in entries {
                match entry {
                    BatchEntry::Insert { payload, metadata } => {
                        let value = serde_json::to_value(&payload)?;
                        let id = Uuid::new_v4().to_string();
                        staged.insert(id.clone(), Record::new(id, value, metadata));
                    }
                    BatchEntry::Patch { id, changes } => {
                        let record = staged
                            .get_mut(&id)
                            .filter(|r| r.is_active())
                            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
                        merge_changes(&mut record.payload, &changes)?;
                        record.metadata.touch(now);
                    }
                    BatchEntry::SoftDelete { id } => {
                        let record = staged
                            .get_mut(&id)
                            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
                        if record.is_active() {
                            record.metadata.mark_deleted(now);
                        }
                    }
                }
            }

            coll.clear();
            for (id, record) in staged {
                coll.insert(id, record);
            }
        }
        tracing::debug!(collection, "committed batch");
        self.notify(collection);
        Ok(())
    }

    async fn subscribe(&self, collection: &str, filter: &QueryFilter) -> Result<Subscription<T>> {
        self.check_failure()?;
        let (tx, rx) = mpsc::unbounded_channel::<SubscriptionEvent<T>>();
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;

        let push: PushFn = Box::new(move |payload| {
            let event = match payload {
                PushPayload::Snapshot(records) => {
                    let decoded: Vec<Record<T>> = records
                        .into_iter()
                        .filter_map(|r| decode_record(r).ok())
                        .collect();
                    SubscriptionEvent::Snapshot(Snapshot {
                        records: decoded,
                        from_cache: false,
                    })
                }
                PushPayload::Error(err) => SubscriptionEvent::Error(err),
            };
            tx.send(event).is_ok()
        });

        // Initial delivery happens before the entry is registered so the
        // subscriber's first event is always the current snapshot.
        let initial = self.snapshot_for(collection, filter);
        (push)(PushPayload::Snapshot(initial));
        self.subscribers.insert(
            id,
            SubscriberEntry {
                collection: collection.to_string(),
                filter: filter.clone(),
                push,
            },
        );
        tracing::debug!(collection, subscription = id, "subscription opened");
        Ok(Subscription { id, events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(owner: &str, at: u64) -> Metadata {
        Metadata::stamp(owner, at)
    }

    #[tokio::test]
    async fn insert_assigns_id_and_query_filters_by_owner() {
        let store = MemoryStore::new();
        let a = store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();
        store
            .insert("todos", json!({"n": 2}), meta("owner-2", 2000))
            .await
            .unwrap();

        let mine: Vec<Record<Value>> = store
            .query("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a);
    }

    #[tokio::test]
    async fn query_orders_by_creation_time() {
        let store = MemoryStore::new();
        store
            .insert("todos", json!({"n": 2}), meta("owner-1", 2000))
            .await
            .unwrap();
        store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();

        let records: Vec<Record<Value>> = store
            .query("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        assert_eq!(records[0].payload["n"], 1);
        assert_eq!(records[1].payload["n"], 2);
    }

    #[tokio::test]
    async fn patch_merges_and_bumps_version() {
        let store = MemoryStore::new();
        let id = store
            .insert("todos", json!({"title": "a", "done": false}), meta("owner-1", 1000))
            .await
            .unwrap();

        RemoteStore::<Value>::patch(&store, "todos", &id, json!({"done": true}))
            .await
            .unwrap();

        let raw = store.get_raw("todos", &id).unwrap();
        assert_eq!(raw.payload, json!({"title": "a", "done": true}));
        assert_eq!(raw.metadata.version, 2);
    }

    #[tokio::test]
    async fn patch_rejects_missing_and_deleted_records() {
        let store = MemoryStore::new();
        let id = store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();
        RemoteStore::<Value>::soft_delete(&store, "todos", &id)
            .await
            .unwrap();

        let missing = RemoteStore::<Value>::patch(&store, "todos", "ghost", json!({})).await;
        assert!(matches!(missing, Err(SyncError::NotFound(_))));

        let deleted = RemoteStore::<Value>::patch(&store, "todos", &id, json!({"n": 2})).await;
        assert!(matches!(deleted, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn soft_delete_leaves_a_tombstone() {
        let store = MemoryStore::new();
        let id = store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();

        RemoteStore::<Value>::soft_delete(&store, "todos", &id)
            .await
            .unwrap();
        // Idempotent on a tombstone.
        RemoteStore::<Value>::soft_delete(&store, "todos", &id)
            .await
            .unwrap();

        assert_eq!(store.record_count("todos"), 1);
        let raw = store.get_raw("todos", &id).unwrap();
        assert!(raw.metadata.deleted);
        assert!(raw.metadata.deleted_at.is_some());

        let active: Vec<Record<Value>> = store
            .query("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn batch_is_atomic() {
        let store = MemoryStore::new();
        let id = store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();

        // Second entry targets a missing record; nothing must apply.
        let result = RemoteStore::<Value>::batch_write(
            &store,
            "todos",
            vec![
                BatchEntry::Patch {
                    id: id.clone(),
                    changes: json!({"n": 99}),
                },
                BatchEntry::Patch {
                    id: "ghost".into(),
                    changes: json!({}),
                },
            ],
        )
        .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert_eq!(store.get_raw("todos", &id).unwrap().payload["n"], 1);

        // A valid batch commits every entry.
        store
            .batch_write(
                "todos",
                vec![
                    BatchEntry::Insert {
                        payload: json!({"n": 2}),
                        metadata: meta("owner-1", 2000),
                    },
                    BatchEntry::Patch {
                        id: id.clone(),
                        changes: json!({"n": 10}),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.record_count("todos"), 2);
        assert_eq!(store.get_raw("todos", &id).unwrap().payload["n"], 10);
    }

    #[tokio::test]
    async fn injected_failures_fire_in_order() {
        let store = MemoryStore::new();
        store.inject_failures(vec![
            SyncError::Network("first".into()),
            SyncError::Timeout { after_ms: 10 },
        ]);

        let first: Result<Vec<Record<Value>>> =
            store.query("todos", &QueryFilter::active_for("o")).await;
        assert_eq!(first, Err(SyncError::Network("first".into())));

        let second: Result<Vec<Record<Value>>> =
            store.query("todos", &QueryFilter::active_for("o")).await;
        assert_eq!(second, Err(SyncError::Timeout { after_ms: 10 }));

        let third: Result<Vec<Record<Value>>> =
            store.query("todos", &QueryFilter::active_for("o")).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn subscription_gets_initial_and_change_snapshots() {
        let store = MemoryStore::new();
        store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();

        let mut sub: Subscription<Value> = store
            .subscribe("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();

        match sub.next_event().await.unwrap() {
            SubscriptionEvent::Snapshot(snapshot) => {
                assert_eq!(snapshot.records.len(), 1);
                assert!(!snapshot.from_cache);
            }
            SubscriptionEvent::Error(err) => panic!("unexpected error: {err}"),
        }

        store
            .insert("todos", json!({"n": 2}), meta("owner-1", 2000))
            .await
            .unwrap();
        match sub.next_event().await.unwrap() {
            SubscriptionEvent::Snapshot(snapshot) => assert_eq!(snapshot.records.len(), 2),
            SubscriptionEvent::Error(err) => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn subscription_respects_owner_filter() {
        let store = MemoryStore::new();
        let mut sub: Subscription<Value> = store
            .subscribe("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        let _ = sub.next_event().await; // initial

        store
            .insert("todos", json!({"n": 1}), meta("owner-2", 1000))
            .await
            .unwrap();
        match sub.next_event().await.unwrap() {
            SubscriptionEvent::Snapshot(snapshot) => assert!(snapshot.records.is_empty()),
            SubscriptionEvent::Error(err) => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let store = MemoryStore::new();
        let sub: Subscription<Value> = store
            .subscribe("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 1);

        drop(sub);
        store
            .insert("todos", json!({"n": 1}), meta("owner-1", 1000))
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn emitted_stream_errors_reach_subscribers() {
        let store = MemoryStore::new();
        let mut sub: Subscription<Value> = store
            .subscribe("todos", &QueryFilter::active_for("owner-1"))
            .await
            .unwrap();
        let _ = sub.next_event().await; // initial

        store.emit_subscription_error(SyncError::Network("stream reset".into()));
        match sub.next_event().await.unwrap() {
            SubscriptionEvent::Error(err) => {
                assert_eq!(err, SyncError::Network("stream reset".into()));
            }
            SubscriptionEvent::Snapshot(_) => panic!("expected an error event"),
        }
    }
}
