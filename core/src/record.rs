//! Record types: a typed payload plus an ownership/versioning envelope.

use crate::{OwnerId, RecordId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Metadata associated with a record.
///
/// The envelope is fixed regardless of the payload type: ownership,
/// timestamps, a version counter bumped on every update, and a soft-delete
/// tombstone. Soft-deleted records are never shown to consumers but are not
/// purged remotely (enables audit/undo and avoids remote-delete races).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Owner of the record (from the identity provider)
    pub owner_id: OwnerId,
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last updated (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Version number, incremented on each update
    pub version: Version,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// When the record was soft-deleted, if ever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<Timestamp>,
}

impl Metadata {
    /// Stamp fresh metadata for a newly created record.
    pub fn stamp(owner_id: impl Into<OwnerId>, now: Timestamp) -> Self {
        Self {
            owner_id: owner_id.into(),
            created_at: now,
            updated_at: now,
            version: 1,
            deleted: false,
            deleted_at: None,
        }
    }

    /// Record a modification: bumps `updated_at` and `version`.
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
        self.version += 1;
    }

    /// Mark the record as soft-deleted.
    pub fn mark_deleted(&mut self, now: Timestamp) {
        self.deleted = true;
        self.deleted_at = Some(now);
        self.touch(now);
    }
}

/// A data record: payload of type `T` plus a stable remote-assigned id and
/// the metadata envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<T> {
    /// Unique identifier, assigned by the remote store
    pub id: RecordId,
    /// The actual data payload
    pub payload: T,
    /// Record metadata
    pub metadata: Metadata,
}

impl<T> Record<T> {
    /// Create a new record.
    pub fn new(id: impl Into<RecordId>, payload: T, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            payload,
            metadata,
        }
    }

    /// Check if the record is active (not soft-deleted).
    pub fn is_active(&self) -> bool {
        !self.metadata.deleted
    }
}
