//! # driftsync memstore
//!
//! An in-memory [`RemoteStore`](driftsync_core::RemoteStore) backend.
//!
//! The store keeps every collection as JSON documents in process memory and
//! implements the full store contract: owner-filtered queries, confirmed
//! writes with server-assigned ids, tombstone soft-deletes, atomic batches,
//! and push subscriptions that deliver a fresh snapshot after every commit.
//!
//! It exists for tests, demos, and as the reference semantics for real
//! backends; fault injection hooks let tests script failures and stream
//! errors deterministically.

pub mod store;

pub use store::MemoryStore;
