//! Collection synchronizer: the authoritative in-memory item list plus the
//! fetch and mutation operations that keep it consistent with the remote
//! store.
//!
//! Mutations are optimistic-after-confirm: local state changes only once the
//! remote write succeeds. Every remote call runs through the executor with
//! the configured retry policy and timeout.

use crate::cache::RecordCache;
use crate::error::{Result, SyncError};
use crate::executor::{Executor, ExecutorConfig, RetryPolicy};
use crate::mirror::{KeyValueStore, Mirror};
use crate::queue::{MutationKind, MutationQueue, PendingMutation};
use crate::record::{Metadata, Record};
use crate::store::{merge_changes, BatchEntry, Identity, Payload, QueryFilter, RemoteStore, WriteOp};
use crate::{now_millis, CollectionName, Timestamp};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-collection configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote collection name
    pub collection: CollectionName,
    /// Mirror namespace (defaults to the collection name)
    pub namespace: String,
    /// Retry policy applied to every remote call
    pub retry: RetryPolicy,
    /// Per-attempt timeout applied to every remote call
    pub timeout: Option<Duration>,
    /// Capture connectivity-failed writes as pending mutations
    pub queue_offline_writes: bool,
}

impl SyncConfig {
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        let collection = collection.into();
        Self {
            namespace: collection.clone(),
            collection,
            retry: RetryPolicy::default(),
            timeout: Some(Duration::from_secs(10)),
            queue_offline_writes: false,
        }
    }
}

/// Observable state of a synchronized collection.
#[derive(Debug, Clone)]
pub struct CollectionState<T> {
    /// Active records, in remote ordering
    pub items: Vec<Record<T>>,
    /// A fetch is in flight
    pub loading: bool,
    /// Last operation error, cleared on the next successful operation
    pub error: Option<SyncError>,
    /// A live subscription is attached
    pub listening: bool,
    /// When the items last came from the remote store
    pub last_sync: Option<Timestamp>,
    /// Items were hydrated from the mirror and not yet confirmed remotely
    pub from_cache: bool,
}

impl<T> Default for CollectionState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            loading: false,
            error: None,
            listening: false,
            last_sync: None,
            from_cache: false,
        }
    }
}

pub(crate) struct ListenerHandle {
    pub(crate) generation: u64,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) struct SyncShared<T> {
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<dyn RemoteStore<T>>,
    pub(crate) identity: Arc<dyn Identity>,
    pub(crate) mirror: Mirror<T>,
    pub(crate) cache: RecordCache<T>,
    pub(crate) state: watch::Sender<CollectionState<T>>,
    pub(crate) fetch_in_flight: AtomicBool,
    pub(crate) listener: Mutex<Option<ListenerHandle>>,
    pub(crate) listener_starting: AtomicBool,
    pub(crate) listener_generation: AtomicU64,
    pub(crate) queue: MutationQueue,
}

/// Synchronizes one remote collection with local observable state.
///
/// Cheap to clone; all clones share the same state.
pub struct CollectionSync<T> {
    pub(crate) shared: Arc<SyncShared<T>>,
}

impl<T> Clone for CollectionSync<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Payload> CollectionSync<T> {
    /// Create a synchronizer and hydrate it from the durable mirror
    /// (cache-then-network: mirrored items are visible immediately, marked
    /// `from_cache` until the first fetch or push snapshot).
    pub fn new(
        store: Arc<dyn RemoteStore<T>>,
        identity: Arc<dyn Identity>,
        kv: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Self {
        let mirror = Mirror::new(kv, &config.namespace);
        let (state, _) = watch::channel(CollectionState::default());
        let this = Self {
            shared: Arc::new(SyncShared {
                config,
                store,
                identity,
                mirror,
                cache: RecordCache::new(),
                state,
                fetch_in_flight: AtomicBool::new(false),
                listener: Mutex::new(None),
                listener_starting: AtomicBool::new(false),
                listener_generation: AtomicU64::new(0),
                queue: MutationQueue::new(),
            }),
        };

        if let Some(snapshot) = this.shared.mirror.load() {
            let active: Vec<Record<T>> = snapshot
                .records
                .into_iter()
                .filter(Record::is_active)
                .collect();
            tracing::debug!(
                collection = %this.shared.config.collection,
                count = active.len(),
                "hydrated from mirror"
            );
            this.shared.cache.rebuild(&active);
            this.update_state(|s| {
                s.items = active;
                s.from_cache = true;
            });
        }
        this
    }

    /// Fetch the collection from the remote store and replace local state.
    ///
    /// Without an authenticated owner this clears local state and returns
    /// empty rather than failing; sign-out is not an error. Concurrent
    /// fetches coalesce: a call that finds one in flight returns the current
    /// items without issuing a second query.
    pub async fn fetch(&self) -> Vec<Record<T>> {
        let shared = &self.shared;
        let Some(owner) = shared.identity.current_owner_id() else {
            tracing::debug!(
                collection = %shared.config.collection,
                "fetch without authenticated owner, clearing local state"
            );
            shared.cache.clear();
            self.update_state(|s| {
                s.items.clear();
                s.loading = false;
                s.error = None;
                s.from_cache = false;
            });
            return Vec::new();
        };

        if shared.fetch_in_flight.swap(true, Ordering::SeqCst) {
            return self.items();
        }
        self.update_state(|s| {
            s.loading = true;
            s.error = None;
        });

        let store = Arc::clone(&shared.store);
        let collection = shared.config.collection.clone();
        let filter = QueryFilter::active_for(owner);
        let result = self
            .run_remote(move || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let filter = filter.clone();
                Box::pin(async move { store.query(&collection, &filter).await })
            })
            .await;
        shared.fetch_in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(records) => {
                self.apply_items(records.clone(), false);
                records
            }
            Err(err) => {
                tracing::warn!(
                    collection = %shared.config.collection,
                    error = %err,
                    "fetch failed, keeping stale items"
                );
                self.update_state(|s| {
                    s.loading = false;
                    s.error = Some(err);
                });
                self.items()
            }
        }
    }

    /// Drop the cache and re-fetch from the remote store.
    pub async fn refresh(&self) -> Vec<Record<T>> {
        self.shared.cache.clear();
        self.fetch().await
    }

    /// Create a record. Local state gains the record only after the remote
    /// insert is confirmed.
    pub async fn create(&self, payload: T) -> Result<Record<T>> {
        let owner = self
            .shared
            .identity
            .current_owner_id()
            .ok_or(SyncError::Unauthenticated)?;
        let metadata = Metadata::stamp(owner, now_millis());

        let store = Arc::clone(&self.shared.store);
        let collection = self.shared.config.collection.clone();
        let remote_payload = payload.clone();
        let remote_metadata = metadata.clone();
        let result = self
            .run_remote(move || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let payload = remote_payload.clone();
                let metadata = remote_metadata.clone();
                Box::pin(async move { store.insert(&collection, payload, metadata).await })
            })
            .await;

        let id = match result {
            Ok(id) => id,
            Err(err) => {
                self.capture_offline(MutationKind::Create, None, serde_json::to_value(&payload)?, &err);
                self.update_state(|s| s.error = Some(err.clone()));
                return Err(err);
            }
        };

        let record = Record::new(id, payload, metadata);
        self.update_state(|s| {
            s.items.push(record.clone());
            s.error = None;
            s.from_cache = false;
        });
        self.shared.cache.upsert(record.clone());
        self.shared.mirror.save(&self.items());
        Ok(record)
    }

    /// Apply a partial update to a record. `changes` is a shallow JSON
    /// object merged over the current payload; the merged result must still
    /// deserialize as `T`.
    pub async fn update(&self, id: &str, changes: Value) -> Result<Record<T>> {
        let current = self
            .items()
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;

        // Validate the merged payload locally before touching the store.
        let mut merged = serde_json::to_value(&current.payload)?;
        merge_changes(&mut merged, &changes)?;
        let new_payload: T = serde_json::from_value(merged)?;

        let store = Arc::clone(&self.shared.store);
        let collection = self.shared.config.collection.clone();
        let record_id = current.id.clone();
        let remote_changes = changes.clone();
        let result = self
            .run_remote(move || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let id = record_id.clone();
                let changes = remote_changes.clone();
                Box::pin(async move { store.patch(&collection, &id, changes).await })
            })
            .await;

        if let Err(err) = result {
            self.capture_offline(MutationKind::Update, Some(current.id.clone()), changes, &err);
            self.update_state(|s| s.error = Some(err.clone()));
            return Err(err);
        }

        let mut updated = current;
        updated.payload = new_payload;
        updated.metadata.touch(now_millis());
        self.replace_item(updated.clone());
        Ok(updated)
    }

    /// Soft-delete a record. It disappears from local state once the remote
    /// tombstone is confirmed.
    pub async fn remove(&self, id: &str) -> Result<()> {
        if !self.items().iter().any(|r| r.id == id) {
            return Err(SyncError::NotFound(id.to_string()));
        }

        let store = Arc::clone(&self.shared.store);
        let collection = self.shared.config.collection.clone();
        let record_id = id.to_string();
        let result = self
            .run_remote(move || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let id = record_id.clone();
                Box::pin(async move { store.soft_delete(&collection, &id).await })
            })
            .await;

        if let Err(err) = result {
            self.capture_offline(MutationKind::Delete, Some(id.to_string()), Value::Null, &err);
            self.update_state(|s| s.error = Some(err.clone()));
            return Err(err);
        }

        self.update_state(|s| {
            s.items.retain(|r| r.id != id);
            s.error = None;
        });
        self.shared.cache.evict(id);
        self.shared.mirror.save(&self.items());
        Ok(())
    }

    /// Apply several writes as one atomic remote batch, then re-fetch.
    /// Creates within the batch share a single timestamp.
    pub async fn batch_update(&self, ops: Vec<WriteOp<T>>) -> Result<Vec<Record<T>>> {
        let owner = self
            .shared
            .identity
            .current_owner_id()
            .ok_or(SyncError::Unauthenticated)?;
        let now = now_millis();

        let mut entries = Vec::with_capacity(ops.len());
        for op in &ops {
            match op {
                WriteOp::Create { payload } => entries.push(BatchEntry::Insert {
                    payload: payload.clone(),
                    metadata: Metadata::stamp(owner.clone(), now),
                }),
                WriteOp::Update { id, changes } => {
                    // Validate against local state when the record is known.
                    if let Some(current) = self.items().into_iter().find(|r| &r.id == id) {
                        let mut merged = serde_json::to_value(&current.payload)?;
                        merge_changes(&mut merged, changes)?;
                        let _: T = serde_json::from_value(merged)?;
                    }
                    entries.push(BatchEntry::Patch {
                        id: id.clone(),
                        changes: changes.clone(),
                    });
                }
                WriteOp::Delete { id } => entries.push(BatchEntry::SoftDelete { id: id.clone() }),
            }
        }

        let store = Arc::clone(&self.shared.store);
        let collection = self.shared.config.collection.clone();
        let entries = Arc::new(entries);
        let result = self
            .run_remote(move || {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                let entries = entries.as_ref().clone();
                Box::pin(async move { store.batch_write(&collection, entries).await })
            })
            .await;

        if let Err(err) = result {
            self.capture_offline(MutationKind::Batch, None, serde_json::to_value(&ops)?, &err);
            self.update_state(|s| s.error = Some(err.clone()));
            return Err(err);
        }

        Ok(self.fetch().await)
    }

    /// Current items.
    pub fn items(&self) -> Vec<Record<T>> {
        self.shared.state.borrow().items.clone()
    }

    /// Current observable state.
    pub fn state(&self) -> CollectionState<T> {
        self.shared.state.borrow().clone()
    }

    /// Subscribe to state transitions.
    pub fn watch(&self) -> watch::Receiver<CollectionState<T>> {
        self.shared.state.subscribe()
    }

    /// Cache-first lookup by id, falling back to the item list.
    pub fn find_by_id(&self, id: &str) -> Option<Record<T>> {
        self.shared
            .cache
            .find_by_id(id)
            .or_else(|| self.items().into_iter().find(|r| r.id == id))
    }

    /// Items matching a predicate over the record.
    pub fn filter(&self, pred: impl Fn(&Record<T>) -> bool) -> Vec<Record<T>> {
        self.items().into_iter().filter(|r| pred(r)).collect()
    }

    /// Items in a caller-defined order; remote ordering is untouched.
    pub fn sorted(
        &self,
        cmp: impl Fn(&Record<T>, &Record<T>) -> std::cmp::Ordering,
    ) -> Vec<Record<T>> {
        let mut items = self.items();
        items.sort_by(cmp);
        items
    }

    /// Cache statistics.
    pub fn stats(&self) -> crate::cache::CacheStats {
        self.shared.cache.stats()
    }

    /// Drop the cache and the durable mirror. Items are untouched.
    pub fn clear_cache(&self) {
        self.shared.cache.clear();
        self.shared.mirror.clear();
    }

    /// Captured offline mutations, in drain order.
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.shared.queue.pending()
    }

    /// Remove and return all captured offline mutations.
    pub fn drain_pending(&self) -> Vec<PendingMutation> {
        self.shared.queue.drain()
    }

    /// Drop one captured offline mutation by id.
    pub fn discard_pending(&self, id: &str) -> bool {
        self.shared.queue.discard(id)
    }

    /// Replace items, cache, and mirror with a confirmed record set.
    pub(crate) fn apply_items(&self, items: Vec<Record<T>>, from_cache: bool) {
        self.shared.cache.rebuild(&items);
        if !from_cache {
            self.shared.mirror.save(&items);
        }
        self.update_state(|s| {
            s.items = items;
            s.loading = false;
            s.error = None;
            s.from_cache = from_cache;
            if !from_cache {
                s.last_sync = Some(now_millis());
            }
        });
    }

    pub(crate) fn update_state(&self, f: impl FnOnce(&mut CollectionState<T>)) {
        self.shared.state.send_modify(f);
    }

    fn replace_item(&self, record: Record<T>) {
        self.update_state(|s| {
            if let Some(slot) = s.items.iter_mut().find(|r| r.id == record.id) {
                *slot = record.clone();
            }
            s.error = None;
        });
        self.shared.cache.upsert(record);
        self.shared.mirror.save(&self.items());
    }

    /// Run one remote call through the executor with the collection's retry
    /// policy and timeout.
    async fn run_remote<R, F>(&self, op: F) -> Result<R>
    where
        R: Clone + Send + Sync + 'static,
        F: Fn() -> BoxFuture<'static, Result<R>> + Send + Sync + 'static,
    {
        let config = ExecutorConfig {
            retry: self.shared.config.retry.clone(),
            timeout: self.shared.config.timeout,
            ..ExecutorConfig::default()
        };
        let executor = Executor::new(config, move |()| op());
        executor.execute(()).await
    }

    fn capture_offline(
        &self,
        kind: MutationKind,
        record_id: Option<String>,
        payload: Value,
        err: &SyncError,
    ) {
        if !self.shared.config.queue_offline_writes {
            return;
        }
        let connectivity = matches!(err, SyncError::Network(_) | SyncError::Timeout { .. });
        if !connectivity {
            return;
        }
        self.shared.queue.enqueue(PendingMutation::new(
            kind,
            self.shared.config.collection.clone(),
            record_id,
            payload,
        ));
    }
}
