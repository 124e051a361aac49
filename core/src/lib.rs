//! # driftsync core
//!
//! A reactive data-synchronization core for local-first applications.
//!
//! This crate keeps an in-memory collection of typed records consistent with
//! a remote document store while providing local caching, a durable mirror
//! for offline-first reads, optimistic mutation, real-time push updates, and
//! retry/backoff/cancellation semantics for every remote operation.
//!
//! ## Components
//!
//! - [`Executor`] - runs a single async unit of work with timeout,
//!   cancellation, and retry/backoff. Every remote call is built on it.
//! - [`Debouncer`] - coalesces bursts of calls into a single delayed
//!   execution, with cancel/flush controls.
//! - [`RecordCache`] and [`Mirror`] - an in-memory id->record map plus a
//!   durable key/value mirror read once at startup (cache-then-network).
//! - [`CollectionSync`] - orchestrates fetch, create/update/(soft)delete,
//!   batch writes, and owns the authoritative item list and its
//!   loading/error/listening flags.
//! - Live subscriptions ([`CollectionSync::start_listening`]) - a push
//!   subscription whose snapshots wholesale-replace the item list.
//!
//! ## Data flow
//!
//! Callers invoke [`CollectionSync`] operations. The synchronizer delegates
//! network calls to the [`Executor`] (wrapped in retry/backoff) and, on
//! success, updates the in-memory list, the [`RecordCache`], and the
//! [`Mirror`]. While listening, push snapshots from the remote store replace
//! the item list independently, superseding any optimistic state.
//!
//! ## Consistency model
//!
//! The remote store is a single authoritative source with one client-visible
//! ordering per collection. Local mutations are applied only after the
//! remote write is confirmed (optimistic-after-confirm). Live snapshots and
//! concurrent local mutations race last-writer-wins; record `version` exists
//! for future conflict detection but is not used for resolution.

pub mod cache;
pub mod debounce;
pub mod error;
pub mod executor;
pub mod live;
pub mod mirror;
pub mod queue;
pub mod record;
pub mod store;
pub mod sync;

// Re-export main types at crate root
pub use cache::{CacheStats, RecordCache};
pub use debounce::{DebounceConfig, Debouncer};
pub use error::SyncError;
pub use executor::{
    CancellationToken, Executor, ExecutorConfig, OpStatus, OperationState, RetryPolicy,
};
pub use mirror::{KeyValueStore, MemoryKeyValue, Mirror, MirrorSnapshot, MIRROR_FORMAT_VERSION};
pub use queue::{MutationKind, MutationQueue, PendingMutation};
pub use record::{Metadata, Record};
pub use store::{
    merge_changes, BatchEntry, Identity, Payload, QueryFilter, RemoteStore, Snapshot,
    StaticIdentity, Subscription, SubscriptionEvent, WriteOp,
};
pub use sync::{CollectionState, CollectionSync, SyncConfig};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type OwnerId = String;
pub type Version = u64;
pub type Timestamp = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis() as Timestamp
}
