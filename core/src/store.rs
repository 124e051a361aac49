//! The remote store abstraction and its supporting types.
//!
//! `RemoteStore` is the seam between the sync core and whatever backend a
//! deployment uses. The core only ever talks to the store through this
//! trait; backends decide transport, auth enforcement, and push delivery.

use crate::error::{Result, SyncError};
use crate::record::{Metadata, Record};
use crate::{OwnerId, RecordId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Bound alias for record payloads. Blanket-implemented; any serde-able
/// owned type qualifies.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Source of the authenticated owner id.
pub trait Identity: Send + Sync {
    /// The current owner, or `None` when signed out.
    fn current_owner_id(&self) -> Option<OwnerId>;
}

/// An `Identity` backed by a settable slot. Useful for tests and for hosts
/// that drive sign-in state themselves.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    owner: Mutex<Option<OwnerId>>,
}

impl StaticIdentity {
    /// Signed-in identity with the given owner.
    pub fn signed_in(owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: Mutex::new(Some(owner.into())),
        }
    }

    /// Signed-out identity.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Change the signed-in owner (or sign out with `None`).
    pub fn set_owner(&self, owner: Option<OwnerId>) {
        *self.owner.lock().unwrap() = owner;
    }
}

impl Identity for StaticIdentity {
    fn current_owner_id(&self) -> Option<OwnerId> {
        self.owner.lock().unwrap().clone()
    }
}

/// Server-side filter for queries and subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFilter {
    /// Restrict to records owned by this owner
    pub owner_id: Option<OwnerId>,
    /// Include soft-deleted records (off for normal consumers)
    pub include_deleted: bool,
}

impl QueryFilter {
    /// The standard consumer filter: this owner's active records.
    pub fn active_for(owner_id: impl Into<OwnerId>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            include_deleted: false,
        }
    }

    /// Whether a record with this metadata passes the filter.
    pub fn matches(&self, metadata: &Metadata) -> bool {
        if let Some(owner) = &self.owner_id {
            if &metadata.owner_id != owner {
                return false;
            }
        }
        self.include_deleted || !metadata.deleted
    }
}

/// A single mutation in a batch, expressed against payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriteOp<T> {
    Create { payload: T },
    Update { id: RecordId, changes: Value },
    Delete { id: RecordId },
}

/// A fully resolved batch mutation handed to the store. Creates carry their
/// already-stamped metadata so the whole batch shares one timestamp.
#[derive(Debug, Clone)]
pub enum BatchEntry<T> {
    Insert { payload: T, metadata: Metadata },
    Patch { id: RecordId, changes: Value },
    SoftDelete { id: RecordId },
}

/// One delivery on a live subscription: the full matching record set.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub records: Vec<Record<T>>,
    /// True only for locally hydrated data, never for store deliveries
    pub from_cache: bool,
}

/// Events delivered on a live subscription channel.
#[derive(Debug)]
pub enum SubscriptionEvent<T> {
    Snapshot(Snapshot<T>),
    Error(SyncError),
}

/// A live subscription handle. Dropping it detaches from the store; the
/// backend prunes the dead channel on its next delivery.
#[derive(Debug)]
pub struct Subscription<T> {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<SubscriptionEvent<T>>,
}

impl<T> Subscription<T> {
    /// Next event, or `None` once the store has dropped the channel.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent<T>> {
        self.events.recv().await
    }
}

/// Backend contract for a single authoritative document store.
///
/// All ids are assigned by the store. Writes are confirmed-before-visible:
/// a method returning `Ok` means the mutation is durable remotely.
#[async_trait]
pub trait RemoteStore<T: Payload>: Send + Sync {
    /// Fetch all records in `collection` matching the filter.
    async fn query(&self, collection: &str, filter: &QueryFilter) -> Result<Vec<Record<T>>>;

    /// Insert a new record; returns the store-assigned id.
    async fn insert(&self, collection: &str, payload: T, metadata: Metadata) -> Result<RecordId>;

    /// Apply a shallow field patch to an existing active record.
    async fn patch(&self, collection: &str, id: &str, changes: Value) -> Result<()>;

    /// Soft-delete a record (tombstone, not purge).
    async fn soft_delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Apply a batch atomically: all entries commit or none do.
    async fn batch_write(&self, collection: &str, entries: Vec<BatchEntry<T>>) -> Result<()>;

    /// Open a push subscription. The store delivers an initial snapshot
    /// immediately, then one snapshot per committed change.
    async fn subscribe(&self, collection: &str, filter: &QueryFilter) -> Result<Subscription<T>>;
}

/// Shallow-merge `changes` into `base`. Both must be JSON objects; top-level
/// fields of `changes` replace (or add to) fields of `base` wholesale,
/// nested objects are not merged recursively.
pub fn merge_changes(base: &mut Value, changes: &Value) -> Result<()> {
    let changes = changes
        .as_object()
        .ok_or_else(|| SyncError::Validation("changes must be a JSON object".to_string()))?;
    let target = base
        .as_object_mut()
        .ok_or_else(|| SyncError::Validation("payload must be a JSON object".to_string()))?;
    for (key, value) in changes {
        target.insert(key.clone(), value.clone());
    }
    Ok(())
}
