//! Live subscription lifecycle for a synchronized collection.
//!
//! While listening, push snapshots from the remote store wholesale-replace
//! the item list, superseding any optimistic local state. A listener that
//! errors detaches and flags the state; the host decides whether to restart.

use crate::error::{Result, SyncError};
use crate::record::Record;
use crate::store::{Payload, QueryFilter, SubscriptionEvent};
use crate::sync::{CollectionSync, ListenerHandle};
use std::sync::atomic::Ordering;

impl<T: Payload> CollectionSync<T> {
    /// Attach a live subscription for the current owner's active records.
    ///
    /// A no-op if already listening. Without an authenticated owner this
    /// returns `Ok` without attaching; sign-out is not an error. A failed
    /// subscribe surfaces as `ListenerFailed` both in the return value and
    /// in the observable state.
    ///
    /// Concurrent calls coalesce the same way concurrent fetches do: the
    /// start path is reserved before the subscribe await, so a second call
    /// arriving mid-subscribe returns without opening a second subscription.
    pub async fn start_listening(&self) -> Result<()> {
        if self
            .shared
            .listener_starting
            .swap(true, Ordering::SeqCst)
        {
            return Ok(());
        }
        let result = self.attach_listener().await;
        self.shared.listener_starting.store(false, Ordering::SeqCst);
        result
    }

    async fn attach_listener(&self) -> Result<()> {
        {
            let slot = self.shared.listener.lock().unwrap();
            if let Some(handle) = &*slot {
                if !handle.task.is_finished() {
                    return Ok(());
                }
            }
        }

        let Some(owner) = self.shared.identity.current_owner_id() else {
            tracing::debug!(
                collection = %self.shared.config.collection,
                "start_listening without authenticated owner, skipping"
            );
            return Ok(());
        };

        let filter = QueryFilter::active_for(owner);
        let mut subscription = match self
            .shared
            .store
            .subscribe(&self.shared.config.collection, &filter)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                let failure = SyncError::ListenerFailed(err.to_string());
                self.update_state(|s| s.error = Some(failure.clone()));
                return Err(failure);
            }
        };

        let generation = self.shared.listener_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update_state(|s| s.listening = true);
        tracing::debug!(
            collection = %self.shared.config.collection,
            subscription = subscription.id,
            "listener attached"
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.next_event().await {
                match event {
                    SubscriptionEvent::Snapshot(snapshot) => {
                        let from_cache = snapshot.from_cache;
                        let active: Vec<Record<T>> = snapshot
                            .records
                            .into_iter()
                            .filter(Record::is_active)
                            .collect();
                        this.apply_items(active, from_cache);
                    }
                    SubscriptionEvent::Error(err) => {
                        tracing::warn!(
                            collection = %this.shared.config.collection,
                            error = %err,
                            "listener errored, detaching"
                        );
                        this.update_state(|s| {
                            s.listening = false;
                            s.error = Some(SyncError::ListenerFailed(err.to_string()));
                        });
                        break;
                    }
                }
            }

            this.update_state(|s| s.listening = false);
            // Clear the slot only if it still belongs to this listener; a
            // newer start_listening may have replaced it already.
            let mut slot = this.shared.listener.lock().unwrap();
            if slot
                .as_ref()
                .is_some_and(|handle| handle.generation == generation)
            {
                *slot = None;
            }
        });

        *self.shared.listener.lock().unwrap() = Some(ListenerHandle { generation, task });
        Ok(())
    }

    /// Detach the live subscription. A no-op if not listening.
    pub fn stop_listening(&self) {
        let handle = self.shared.listener.lock().unwrap().take();
        match handle {
            Some(handle) => {
                handle.task.abort();
                self.update_state(|s| s.listening = false);
                tracing::debug!(
                    collection = %self.shared.config.collection,
                    "listener detached"
                );
            }
            None => {
                tracing::debug!(
                    collection = %self.shared.config.collection,
                    "stop_listening with no active listener"
                );
            }
        }
    }

    /// Whether a live subscription is currently attached.
    pub fn is_listening(&self) -> bool {
        self.state().listening
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MemoryKeyValue;
    use crate::record::Metadata;
    use crate::store::{BatchEntry, RemoteStore, Snapshot, StaticIdentity, Subscription};
    use crate::sync::SyncConfig;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// A store whose subscriptions are driven manually by the test.
    #[derive(Default)]
    struct PushStore {
        senders: Mutex<Vec<mpsc::UnboundedSender<SubscriptionEvent<Value>>>>,
        refuse_subscribe: Mutex<bool>,
        subscribe_delay: Option<std::time::Duration>,
    }

    impl PushStore {
        fn push_snapshot(&self, records: Vec<Record<Value>>) {
            for sender in self.senders.lock().unwrap().iter() {
                let _ = sender.send(SubscriptionEvent::Snapshot(Snapshot {
                    records: records.clone(),
                    from_cache: false,
                }));
            }
        }

        fn push_error(&self, err: SyncError) {
            for sender in self.senders.lock().unwrap().iter() {
                let _ = sender.send(SubscriptionEvent::Error(err.clone()));
            }
        }
    }

    #[async_trait]
    impl RemoteStore<Value> for PushStore {
        async fn query(&self, _c: &str, _f: &QueryFilter) -> crate::error::Result<Vec<Record<Value>>> {
            Ok(Vec::new())
        }
        async fn insert(&self, _c: &str, _p: Value, _m: Metadata) -> crate::error::Result<String> {
            Ok("unused".into())
        }
        async fn patch(&self, _c: &str, _id: &str, _ch: Value) -> crate::error::Result<()> {
            Ok(())
        }
        async fn soft_delete(&self, _c: &str, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn batch_write(
            &self,
            _c: &str,
            _entries: Vec<BatchEntry<Value>>,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _c: &str,
            _f: &QueryFilter,
        ) -> crate::error::Result<Subscription<Value>> {
            if let Some(delay) = self.subscribe_delay {
                tokio::time::sleep(delay).await;
            }
            if *self.refuse_subscribe.lock().unwrap() {
                return Err(SyncError::Network("subscribe refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let mut senders = self.senders.lock().unwrap();
            senders.push(tx);
            Ok(Subscription {
                id: senders.len() as u64,
                events: rx,
            })
        }
    }

    fn sync_with(store: Arc<PushStore>, owner: Option<&str>) -> CollectionSync<Value> {
        let identity = match owner {
            Some(owner) => StaticIdentity::signed_in(owner),
            None => StaticIdentity::signed_out(),
        };
        CollectionSync::new(
            store,
            Arc::new(identity),
            Arc::new(MemoryKeyValue::new()),
            SyncConfig::new("todos"),
        )
    }

    fn record(id: &str, n: u64) -> Record<Value> {
        Record::new(id, json!({"n": n}), Metadata::stamp("owner-1", n))
    }

    #[tokio::test]
    async fn snapshots_replace_items() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));

        sync.start_listening().await.unwrap();
        assert!(sync.is_listening());

        let mut rx = sync.watch();
        store.push_snapshot(vec![record("a", 1), record("b", 2)]);
        while sync.items().len() != 2 {
            rx.changed().await.unwrap();
        }

        // A deletion arriving by push also disappears locally.
        store.push_snapshot(vec![record("b", 2)]);
        while sync.items().len() != 1 {
            rx.changed().await.unwrap();
        }
        assert_eq!(sync.items()[0].id, "b");
        assert!(!sync.state().from_cache);
    }

    #[tokio::test]
    async fn snapshots_drop_tombstones() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));
        sync.start_listening().await.unwrap();

        let mut deleted = record("dead", 1);
        deleted.metadata.mark_deleted(2);
        let mut rx = sync.watch();
        store.push_snapshot(vec![record("alive", 1), deleted]);
        while sync.items().is_empty() {
            rx.changed().await.unwrap();
        }
        assert_eq!(sync.items().len(), 1);
        assert_eq!(sync.items()[0].id, "alive");
    }

    #[tokio::test]
    async fn start_is_idempotent_while_attached() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));

        sync.start_listening().await.unwrap();
        sync.start_listening().await.unwrap();
        assert_eq!(store.senders.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_open_a_single_subscription() {
        // A slow subscribe lets two starts interleave at the await point.
        let store = Arc::new(PushStore {
            subscribe_delay: Some(std::time::Duration::from_millis(50)),
            ..PushStore::default()
        });
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));

        let first = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.start_listening().await })
        };
        let second = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.start_listening().await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(store.senders.lock().unwrap().len(), 1);
        assert!(sync.is_listening());

        // One stop fully detaches; no zombie listener remains.
        sync.stop_listening();
        assert!(!sync.is_listening());
        assert!(sync.shared.listener.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn start_without_owner_is_a_soft_no_op() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), None);

        sync.start_listening().await.unwrap();
        assert!(!sync.is_listening());
        assert!(store.senders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_subscribe_surfaces_listener_failed() {
        let store = Arc::new(PushStore::default());
        *store.refuse_subscribe.lock().unwrap() = true;
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));

        let result = sync.start_listening().await;
        assert!(matches!(result, Err(SyncError::ListenerFailed(_))));
        assert!(!sync.is_listening());
        assert!(matches!(sync.state().error, Some(SyncError::ListenerFailed(_))));
    }

    #[tokio::test]
    async fn listener_error_detaches_and_allows_restart() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));
        sync.start_listening().await.unwrap();

        let mut rx = sync.watch();
        store.push_error(SyncError::Network("stream reset".into()));
        while sync.is_listening() {
            rx.changed().await.unwrap();
        }
        assert!(matches!(sync.state().error, Some(SyncError::ListenerFailed(_))));

        // A fresh start attaches a new subscription.
        sync.start_listening().await.unwrap();
        assert!(sync.is_listening());
        assert_eq!(store.senders.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_listening_is_idempotent() {
        let store = Arc::new(PushStore::default());
        let sync = sync_with(Arc::clone(&store), Some("owner-1"));

        sync.stop_listening(); // nothing attached yet

        sync.start_listening().await.unwrap();
        sync.stop_listening();
        assert!(!sync.is_listening());
        sync.stop_listening();
    }
}
