//! Access-time write-back cache
//!
//! With "time-stamp on read" active every successful read would otherwise
//! cost a write transaction. Instead the newest access time per entry is
//! kept here and written out in one transaction once the entry count
//! reaches the configured limit, and on close.
//!
//! Lives inside the cache state and is only touched under the cache lock.

use crate::types::{CacheKey, Timestamp};
use crate::Result;
use std::collections::BTreeMap;

/// Access cache statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AccessCacheStats {
    /// Lookups answered from memory
    pub hits: u64,
    /// Lookups that fell through to the attribute table
    pub misses: u64,
    /// Current number of entries
    pub size: usize,
    /// Entry limit (0 = cache inactive)
    pub capacity: usize,
    /// Completed dumps to the store
    pub flushes: u64,
    /// Entries written by those dumps
    pub flushed_entries: u64,
}

impl AccessCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct AccessCache {
    entries: BTreeMap<CacheKey, Timestamp>,
    limit: usize,
    stats: AccessCacheStats,
}

impl AccessCache {
    /// `limit == 0` disables deferred writes
    pub fn new(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit,
            stats: AccessCacheStats {
                capacity: limit,
                ..Default::default()
            },
        }
    }

    /// Whether reads should defer access-time updates to this cache
    pub fn is_active(&self) -> bool {
        self.limit > 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.stats.capacity = limit;
    }

    /// Insert or overwrite; an older stamp never replaces a newer one
    pub fn record_access(&mut self, key: CacheKey, time_stamp: Timestamp) {
        let slot = self.entries.entry(key).or_insert(time_stamp);
        if *slot < time_stamp {
            *slot = time_stamp;
        }
    }

    pub fn get_access_time(&mut self, key: &CacheKey) -> Option<Timestamp> {
        match self.entries.get(key) {
            Some(ts) => {
                self.stats.hits += 1;
                Some(*ts)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Read without touching statistics (purge scans)
    pub fn peek(&self, key: &CacheKey) -> Option<Timestamp> {
        self.entries.get(key).copied()
    }

    /// Drop every entry stored under `key`, any version or subkey
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|k, _| k.key != key);
    }

    pub fn remove_entry(&mut self, key: &CacheKey) {
        self.entries.remove(key);
    }

    pub fn is_limit_reached(&self) -> bool {
        self.is_active() && self.entries.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Write every entry through `write`, in key order.
    ///
    /// The map is left untouched: the caller runs this inside one
    /// transaction and calls [`mark_flushed`](Self::mark_flushed) once that
    /// transaction has committed.
    pub fn dump_to_store<F>(&self, mut write: F) -> Result<usize>
    where
        F: FnMut(&CacheKey, Timestamp) -> Result<()>,
    {
        for (key, ts) in &self.entries {
            write(key, *ts)?;
        }
        Ok(self.entries.len())
    }

    /// Forget entries a committed dump has persisted
    pub fn mark_flushed(&mut self, count: usize) {
        self.entries.clear();
        self.stats.flushes += 1;
        self.stats.flushed_entries += count as u64;
    }

    pub fn stats(&self) -> AccessCacheStats {
        AccessCacheStats {
            size: self.entries.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheError;

    #[test]
    fn test_record_and_lookup() {
        let mut cache = AccessCache::new(10);
        let key = CacheKey::new("doc", 1, "");
        assert_eq!(cache.get_access_time(&key), None);

        cache.record_access(key.clone(), 100);
        cache.record_access(key.clone(), 90);
        assert_eq!(cache.get_access_time(&key), Some(100));

        cache.record_access(key.clone(), 120);
        assert_eq!(cache.get_access_time(&key), Some(120));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_limit() {
        let mut cache = AccessCache::new(2);
        cache.record_access(CacheKey::new("a", 1, ""), 1);
        assert!(!cache.is_limit_reached());
        cache.record_access(CacheKey::new("b", 1, ""), 1);
        assert!(cache.is_limit_reached());

        let inactive = AccessCache::new(0);
        assert!(!inactive.is_active());
        assert!(!inactive.is_limit_reached());
    }

    #[test]
    fn test_remove_by_key() {
        let mut cache = AccessCache::new(10);
        cache.record_access(CacheKey::new("a", 1, ""), 1);
        cache.record_access(CacheKey::new("a", 2, "x"), 1);
        cache.record_access(CacheKey::new("ab", 1, ""), 1);
        cache.remove("a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&CacheKey::new("ab", 1, "")), Some(1));
    }

    #[test]
    fn test_dump() {
        let mut cache = AccessCache::new(10);
        cache.record_access(CacheKey::new("b", 1, ""), 20);
        cache.record_access(CacheKey::new("a", 1, ""), 10);

        let mut written = Vec::new();
        let count = cache
            .dump_to_store(|key, ts| {
                written.push((key.key.clone(), ts));
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(written, vec![("a".to_string(), 10), ("b".to_string(), 20)]);
        // nothing is forgotten until the write is known to be durable
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().flushes, 0);

        cache.mark_flushed(count);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().flushes, 1);
        assert_eq!(cache.stats().flushed_entries, 2);
    }

    #[test]
    fn test_failed_dump_keeps_entries() {
        let mut cache = AccessCache::new(10);
        cache.record_access(CacheKey::new("a", 1, ""), 10);
        let result = cache.dump_to_store(|_, _| Err(CacheError::Closed));
        assert!(result.is_err());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().flushes, 0);
    }
}
