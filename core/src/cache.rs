//! In-memory record cache.
//!
//! The cache is a pure performance accessory: its content is always a subset
//! of the last known item list (or stale) and is never the source of truth.
//! It is rebuilt wholesale on every successful fetch or push snapshot; a
//! full-replace strategy avoids staleness bugs at the cost of recompute,
//! acceptable for collections of a few hundred records.

use crate::{Record, RecordId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached records
    pub size: usize,
    /// Number of successful lookups since creation
    pub hits: u64,
}

/// An id -> record map with hit accounting.
#[derive(Debug)]
pub struct RecordCache<T> {
    records: DashMap<RecordId, Record<T>>,
    hits: AtomicU64,
}

impl<T: Clone> RecordCache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            hits: AtomicU64::new(0),
        }
    }

    /// Look up a record by id, counting a hit on success.
    pub fn find_by_id(&self, id: &str) -> Option<Record<T>> {
        let found = self.records.get(id).map(|r| r.clone());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: Record<T>) {
        self.records.insert(record.id.clone(), record);
    }

    /// Remove a record by id.
    pub fn evict(&self, id: &str) {
        self.records.remove(id);
    }

    /// Remove all records.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Replace the entire cache content with the given items.
    pub fn rebuild(&self, items: &[Record<T>]) {
        self.records.clear();
        for record in items {
            self.records.insert(record.id.clone(), record.clone());
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.records.len(),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T: Clone> Default for RecordCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;
    use serde_json::{json, Value};

    fn record(id: &str) -> Record<Value> {
        Record::new(id, json!({"id": id}), Metadata::stamp("owner-1", 1000))
    }

    #[test]
    fn upsert_and_find() {
        let cache = RecordCache::new();
        cache.upsert(record("a"));

        assert!(cache.find_by_id("a").is_some());
        assert!(cache.find_by_id("b").is_none());
        assert_eq!(cache.stats(), CacheStats { size: 1, hits: 1 });
    }

    #[test]
    fn misses_do_not_count_hits() {
        let cache: RecordCache<Value> = RecordCache::new();
        cache.find_by_id("ghost");
        cache.find_by_id("ghost");
        assert_eq!(cache.stats().hits, 0);
    }

    #[test]
    fn evict_and_clear() {
        let cache = RecordCache::new();
        cache.upsert(record("a"));
        cache.upsert(record("b"));

        cache.evict("a");
        assert!(cache.find_by_id("a").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn rebuild_replaces_content() {
        let cache = RecordCache::new();
        cache.upsert(record("stale"));

        let items = vec![record("a"), record("b")];
        cache.rebuild(&items);

        assert!(cache.find_by_id("stale").is_none());
        assert!(cache.find_by_id("a").is_some());
        assert!(cache.find_by_id("b").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rebuild_keeps_cache_subset_of_items() {
        let cache = RecordCache::new();
        let items: Vec<Record<Value>> = (0..50).map(|i| record(&format!("rec-{i}"))).collect();
        cache.rebuild(&items);

        // Every cached entry must come from the item list.
        for item in &items {
            assert_eq!(cache.find_by_id(&item.id).unwrap().id, item.id);
        }
        assert_eq!(cache.len(), items.len());
    }
}
