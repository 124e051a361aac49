//! Durable mirror: a versioned snapshot of the item list in a key/value
//! store, read once at startup for instant offline-first rendering.
//!
//! Mirror writes are best-effort. A failed save is logged and swallowed; the
//! in-memory state is already correct and the next successful save catches
//! up. A failed or unreadable load falls back to an empty start.

use crate::error::{Result, SyncError};
use crate::{now_millis, Record, Timestamp};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Snapshot format version; bumped on incompatible layout changes.
pub const MIRROR_FORMAT_VERSION: u32 = 1;

/// Pluggable durable key/value backend (browser localStorage, a file, an
/// embedded database).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// What gets persisted: the records plus enough framing to reject
/// incompatible or future snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot<T> {
    pub format_version: u32,
    pub saved_at: Timestamp,
    pub records: Vec<Record<T>>,
}

/// A durable mirror of one collection's records under a namespaced key.
pub struct Mirror<T> {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Mirror<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: &str) -> Self {
        Self {
            kv,
            key: format!("driftsync:mirror:{namespace}"),
            _payload: PhantomData,
        }
    }

    /// Persist the given records. Failures are logged, never surfaced:
    /// mirror durability must not fail a sync operation.
    pub fn save(&self, records: &[Record<T>]) {
        let snapshot = MirrorSnapshot {
            format_version: MIRROR_FORMAT_VERSION,
            saved_at: now_millis(),
            records: records.to_vec(),
        };
        let serialized = match serde_json::to_string(&snapshot) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "mirror serialize failed");
                return;
            }
        };
        if let Err(err) = self.kv.set(&self.key, &serialized) {
            tracing::warn!(key = %self.key, error = %err, "mirror save failed");
        }
    }

    /// Load the last persisted snapshot, if any. Unreadable, corrupt, or
    /// future-versioned snapshots are discarded with a warning.
    pub fn load(&self) -> Option<MirrorSnapshot<T>> {
        let raw = match self.kv.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "mirror load failed");
                return None;
            }
        };
        let snapshot: MirrorSnapshot<T> = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(key = %self.key, error = %err, "mirror snapshot corrupt, discarding");
                return None;
            }
        };
        if snapshot.format_version > MIRROR_FORMAT_VERSION {
            tracing::warn!(
                key = %self.key,
                found = snapshot.format_version,
                supported = MIRROR_FORMAT_VERSION,
                "mirror snapshot from a newer format, discarding"
            );
            return None;
        }
        Some(snapshot)
    }

    /// Remove the persisted snapshot.
    pub fn clear(&self) {
        if let Err(err) = self.kv.remove(&self.key) {
            tracing::warn!(key = %self.key, error = %err, "mirror clear failed");
        }
    }
}

impl<T> std::fmt::Debug for Mirror<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror").field("key", &self.key).finish()
    }
}

/// In-memory `KeyValueStore`, for tests and ephemeral setups.
#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    entries: DashMap<String, String>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValue {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
