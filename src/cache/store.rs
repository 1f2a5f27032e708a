//! Concurrent key → entry map.

use std::sync::Arc;

use dashmap::DashMap;
use metrics::gauge;

use super::entry::CacheEntry;

pub(crate) const METRIC_ENTRIES: &str = "querycache_entries";

/// Published entries keyed by endpoint path.
///
/// Every operation is atomic per key: readers observe either the entry
/// before or after a concurrent publish. Displaced entries are handed back
/// to the caller, which retires them by dropping its handle once the swap
/// is visible.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<String, Arc<CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `entry` under `key`, returning the entry it replaced.
    pub fn publish(&self, key: &str, entry: CacheEntry) -> Option<Arc<CacheEntry>> {
        let displaced = self.entries.insert(key.to_string(), Arc::new(entry));
        self.record_len();
        displaced
    }

    /// Current entry for `key`. The returned handle keeps the entry, and any
    /// blob behind it, alive after it has been replaced.
    pub fn load(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let removed = self.entries.remove(key).map(|(_, entry)| entry);
        self.record_len();
        removed
    }

    /// Remove every entry, returning them for retirement.
    pub fn drain(&self) -> Vec<Arc<CacheEntry>> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let drained = keys
            .iter()
            .filter_map(|key| self.entries.remove(key).map(|(_, entry)| entry))
            .collect();
        self.record_len();
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record_len(&self) {
        gauge!(METRIC_ENTRIES).set(self.entries.len() as f64);
    }
}
