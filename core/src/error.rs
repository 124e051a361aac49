//! Error types for the driftsync core.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the sync core.
///
/// Errors are `Clone` so they can be stored in observable state and in an
/// operation's attempt history.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    // Transient errors (retried)
    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("unknown error: {0}")]
    Unknown(String),

    // Terminal errors (never retried)
    #[error("no authenticated owner")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("listener failed: {0}")]
    ListenerFailed(String),

    #[error("operation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the retry layer may re-attempt an operation that failed with
    /// this error. Unknown errors are retried conservatively (the attempt
    /// cap still applies); everything terminal is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout { .. } | SyncError::Unknown(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Validation(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
