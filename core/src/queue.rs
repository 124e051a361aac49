//! Offline mutation queue.
//!
//! Writes that fail for connectivity reasons can be captured as pending
//! mutations for the host to inspect, drain, and resubmit once connectivity
//! returns. The core records them; replay policy belongs to the host.

use crate::{now_millis, CollectionName, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use uuid::Uuid;

/// What kind of write the pending mutation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Batch,
}

/// A captured write that could not reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub id: String,
    pub kind: MutationKind,
    pub collection: CollectionName,
    /// Target record, absent for creates and batches
    pub record_id: Option<RecordId>,
    /// The payload or changes of the original write
    pub payload: Value,
    pub created_at: Timestamp,
    /// How many times a replay has been attempted
    pub attempts: u32,
    /// Higher drains first
    pub priority: u8,
}

impl PendingMutation {
    pub fn new(
        kind: MutationKind,
        collection: impl Into<CollectionName>,
        record_id: Option<RecordId>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            collection: collection.into(),
            record_id,
            payload,
            created_at: now_millis(),
            attempts: 0,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

/// FIFO queue of pending mutations with priority override.
#[derive(Debug, Default)]
pub struct MutationQueue {
    entries: Mutex<Vec<PendingMutation>>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, mutation: PendingMutation) {
        tracing::debug!(
            kind = ?mutation.kind,
            collection = %mutation.collection,
            "queueing offline mutation"
        );
        self.entries.lock().unwrap().push(mutation);
    }

    /// Pending mutations in drain order: priority descending, then oldest
    /// first within a priority level.
    pub fn pending(&self) -> Vec<PendingMutation> {
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        entries
    }

    /// Remove and return everything, in drain order.
    pub fn drain(&self) -> Vec<PendingMutation> {
        let drained = self.pending();
        self.entries.lock().unwrap().clear();
        drained
    }

    /// Drop a single pending mutation by id.
    pub fn discard(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|m| m.id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
