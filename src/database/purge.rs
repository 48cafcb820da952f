//! Purge Module - expiration and version cleanup
//!
//! A whole-cache purge runs in two phases so the cache lock is only held for
//! one batch at a time:
//!
//! 1. scan the attribute table in key order, `batch_size` rows per lock hold,
//!    and select candidates one key group at a time
//! 2. delete the candidates, one transaction per batch
//!
//! Between batches the lock is released (and the configured sleep applied),
//! so readers and writers interleave with a long purge. A candidate whose
//! record changed between scan and delete is left alone.

use super::core::{BlobCache, CacheInner, CacheState, Counters, Settings};
use crate::cache::AccessCache;
use crate::storage::{AttributeRecord, AttributeRow};
use crate::types::{is_expired, CacheKey, TimeStampPolicy, Timestamp, VersionRetention};
use crate::{CacheError, Result};
use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Minimum batch size while purging on open
const OPEN_PURGE_BATCH: usize = 2500;

/// What a failed delete batch does to the rest of the purge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PurgeErrorPolicy {
    /// Log, count the batch as failed, keep going
    #[default]
    Continue,
    /// Stop and return the error
    Abort,
}

/// Outcome of one purge run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Attribute rows visited
    pub scanned: u64,
    /// Entries selected for deletion
    pub selected: u64,
    /// Entries (or rows, when truncating) deleted
    pub removed: u64,
    /// Candidates that changed after the scan and were kept
    pub skipped: u64,
    /// Candidates in delete batches that failed
    pub failed: u64,
    pub batches: u64,
    /// Ended early by `stop_purge`
    pub stopped: bool,
    /// Both tables were cleared in one step
    pub truncated: bool,
    pub files_removed: u64,
}

struct Candidate {
    key: CacheKey,
    record: AttributeRecord,
}

/// Selection rule shared by whole and scoped purges
struct Selection {
    now: Timestamp,
    timeout: u64,
    keep: VersionRetention,
    lfu: bool,
}

impl Selection {
    fn new(now: Timestamp, timeout: u64, keep: VersionRetention, settings: &Settings) -> Self {
        Self {
            now,
            timeout,
            keep,
            lfu: settings
                .policy
                .contains(TimeStampPolicy::EXPIRE_LEAST_FREQUENTLY_USED),
        }
    }

    fn selects(&self, version: i32, max_version: i32, age: Timestamp) -> bool {
        (self.timeout > 0 && is_expired(self.now, self.timeout, age))
            || (self.keep == VersionRetention::DropOlder && version < max_version)
            || (self.keep == VersionRetention::DropAll && self.timeout == 0)
    }

    /// Pick candidates from `rows`, which all share one key.
    ///
    /// `subkey` restricts a scoped purge (`""` matches every subkey); the
    /// newest version is then judged per subkey instead of per key.
    fn select(
        &self,
        rows: &[AttributeRow],
        subkey: Option<&str>,
        settings: &Settings,
        access: &AccessCache,
    ) -> Vec<Candidate> {
        let probe_stamps: AHashMap<i32, Timestamp> = rows
            .iter()
            .filter(|row| row.key.subkey.is_empty())
            .map(|row| (row.key.version, row.record.time_stamp))
            .collect();

        let entries: Vec<&AttributeRow> = rows
            .iter()
            .filter(|row| !row.record.probe)
            .filter(|row| match subkey {
                Some(wanted) => wanted.is_empty() || row.key.subkey == wanted,
                None => true,
            })
            .collect();

        let scope = |row: &AttributeRow| -> String {
            if subkey.is_some() {
                row.key.subkey.clone()
            } else {
                String::new()
            }
        };
        let mut max_versions: AHashMap<String, i32> = AHashMap::new();
        for row in &entries {
            let slot = max_versions.entry(scope(row)).or_insert(row.key.version);
            *slot = (*slot).max(row.key.version);
        }

        entries
            .into_iter()
            .filter(|row| {
                let max_version = max_versions.get(&scope(row)).copied().unwrap_or(row.key.version);
                let mut age = row.record.time_stamp;
                if self.lfu {
                    if let Some(stamp) = probe_stamps.get(&row.key.version) {
                        age = age.max(*stamp);
                    }
                    if let Some(stamp) = access.peek(&settings.access_key(&row.key)) {
                        age = age.max(stamp);
                    }
                }
                self.selects(row.key.version, max_version, age)
            })
            .map(|row| Candidate {
                key: row.key.clone(),
                record: row.record,
            })
            .collect()
    }
}

impl BlobCache {
    // ==================== Whole-Cache Purge ====================

    /// Delete expired entries and, per `keep`, superseded versions.
    ///
    /// `timeout == 0` disables expiration; together with `DropAll` it clears
    /// the whole cache.
    pub fn purge(&self, timeout: u64, keep: VersionRetention) -> Result<PurgeStats> {
        if timeout == 0 && keep == VersionRetention::DropAll {
            return self.truncate();
        }

        let (selection, batch_size, batch_sleep) = {
            let state = self.inner.lock_state()?;
            state.writable()?;
            let selection = Selection::new(self.inner.now(), timeout, keep, &state.settings);
            (selection, state.settings.batch_size, state.settings.batch_sleep)
        };
        let mut stats = PurgeStats::default();
        if timeout == 0 && keep == VersionRetention::KeepAll {
            return Ok(stats);
        }

        // 1. Scan: key groups may straddle batch boundaries
        let mut candidates = Vec::new();
        let mut group: Vec<AttributeRow> = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            if self.inner.stop_purge.swap(false, Ordering::AcqRel) {
                stats.stopped = true;
                tracing::info!(cache = %self.inner.name, scanned = stats.scanned, "Purge stopped during scan");
                return Ok(stats);
            }

            let more = {
                let state = self.inner.lock_state()?;
                let store = state.writable()?;
                let (rows, more) =
                    store.read(|txn| store.attrs.scan_after(txn, after.as_deref(), batch_size))?;
                stats.scanned += rows.len() as u64;
                if let Some(last) = rows.last() {
                    after = Some(last.raw_key.clone());
                }

                for row in rows {
                    if group.first().is_some_and(|first| first.key.key != row.key.key) {
                        candidates.extend(selection.select(&group, None, &state.settings, &state.access));
                        group.clear();
                    }
                    group.push(row);
                }
                if !more {
                    candidates.extend(selection.select(&group, None, &state.settings, &state.access));
                    group.clear();
                }
                more
            };
            stats.batches += 1;

            if !more {
                break;
            }
            if !batch_sleep.is_zero() {
                thread::sleep(batch_sleep);
            }
        }

        // 2. Delete
        stats.selected = candidates.len() as u64;
        self.delete_candidates(&candidates, &mut stats)?;

        tracing::info!(
            cache = %self.inner.name,
            scanned = stats.scanned,
            removed = stats.removed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Purge finished"
        );
        Ok(stats)
    }

    // ==================== Scoped Purge ====================

    /// Purge the entries of one key, optionally one subkey (`""` = all).
    ///
    /// An empty `key` purges the whole cache.
    pub fn purge_key(&self, key: &str, subkey: &str, timeout: u64, keep: VersionRetention) -> Result<PurgeStats> {
        if key.is_empty() {
            return self.purge(timeout, keep);
        }

        let mut stats = PurgeStats::default();
        let candidates = {
            let state = self.inner.lock_state()?;
            let store = state.writable()?;
            if timeout == 0 && keep == VersionRetention::KeepAll {
                return Ok(stats);
            }
            let selection = Selection::new(self.inner.now(), timeout, keep, &state.settings);
            let rows = store.read(|txn| store.attrs.rows_for(txn, key))?;
            stats.scanned = rows.len() as u64;
            selection.select(&rows, Some(subkey), &state.settings, &state.access)
        };

        stats.selected = candidates.len() as u64;
        self.delete_candidates(&candidates, &mut stats)?;
        tracing::debug!(key, subkey, removed = stats.removed, "Scoped purge finished");
        Ok(stats)
    }

    /// Ask a running purge to stop after its current batch
    pub fn stop_purge(&self) {
        self.inner.stop_purge.store(true, Ordering::Release);
    }

    fn delete_candidates(&self, candidates: &[Candidate], stats: &mut PurgeStats) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let (batch_size, batch_sleep, error_policy) = {
            let state = self.inner.lock_state()?;
            let settings = &state.settings;
            (settings.batch_size, settings.batch_sleep, settings.error_policy)
        };

        let mut chunks = candidates.chunks(batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            if self.inner.stop_purge.swap(false, Ordering::AcqRel) {
                stats.stopped = true;
                tracing::info!(cache = %self.inner.name, removed = stats.removed, "Purge stopped");
                return Ok(());
            }

            let result = {
                let mut state = self.inner.lock_state()?;
                let CacheState {
                    store,
                    settings,
                    access,
                } = &mut *state;
                let store = store.as_ref().ok_or(CacheError::Closed)?;
                let removed = store.transaction(settings.write_sync, |txn| {
                    let mut removed = Vec::with_capacity(chunk.len());
                    for candidate in chunk {
                        match store.attrs.get(txn, &candidate.key)? {
                            Some(current) if current == candidate.record => {
                                store.drop_entry(txn, &candidate.key)?;
                                removed.push(candidate);
                            }
                            _ => {}
                        }
                    }
                    Ok(removed)
                });
                if let Ok(removed) = &removed {
                    store.drop_files(
                        removed
                            .iter()
                            .filter(|candidate| candidate.record.overflow)
                            .map(|candidate| &candidate.key),
                    );
                    for candidate in removed {
                        access.remove_entry(&candidate.key);
                    }
                }
                removed.map(|removed| removed.len() as u64)
            };
            stats.batches += 1;

            match result {
                Ok(removed) => {
                    stats.removed += removed;
                    stats.skipped += chunk.len() as u64 - removed;
                    Counters::bump(&self.inner.counters.purged, removed);
                }
                Err(e) if error_policy == PurgeErrorPolicy::Continue && is_batch_error(&e) => {
                    tracing::warn!(cache = %self.inner.name, error = %e, entries = chunk.len(), "Purge batch failed");
                    stats.failed += chunk.len() as u64;
                }
                Err(e) => return Err(e),
            }

            if chunks.peek().is_some() && !batch_sleep.is_zero() {
                thread::sleep(batch_sleep);
            }
        }
        Ok(())
    }

    /// Clear both tables and sweep overflow files
    fn truncate(&self) -> Result<PurgeStats> {
        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;
        store.ensure_writable()?;

        let rows = store.transaction(settings.write_sync, |txn| {
            let rows = store.attrs.len(txn)?;
            store.blobs.clear(txn)?;
            store.attrs.clear(txn)?;
            Ok(rows)
        })?;
        let files = store.files.sweep()?;
        access.clear();
        Counters::bump(&self.inner.counters.purged, rows);

        tracing::info!(cache = %self.inner.name, rows, files, "Cache truncated");
        Ok(PurgeStats {
            removed: rows,
            batches: 1,
            truncated: true,
            files_removed: files as u64,
            ..Default::default()
        })
    }

    /// Purge on mount, with large batches and no sleep
    pub(crate) fn purge_on_open(&self) -> Result<()> {
        let (saved, timeout, retention) = {
            let mut state = self.inner.lock_state()?;
            let settings = &mut state.settings;
            let saved = (settings.batch_size, settings.batch_sleep);
            settings.batch_size = settings.batch_size.max(OPEN_PURGE_BATCH);
            settings.batch_sleep = Duration::ZERO;
            (saved, settings.timeout, settings.retention)
        };

        let result = self.purge(timeout, retention);

        {
            let mut state = self.inner.state.lock();
            state.settings.batch_size = saved.0;
            state.settings.batch_sleep = saved.1;
        }

        let stats = result?;
        tracing::info!(cache = %self.inner.name, removed = stats.removed, "Purged on open");
        Ok(())
    }

    // ==================== Background Purge ====================

    /// Run `purge(timeout, retention)` from the current settings every
    /// `interval` on a background thread. Replaces a running worker.
    pub fn start_background_purge(&self, interval: Duration) -> Result<()> {
        {
            let state = self.inner.lock_state()?;
            state.writable()?;
        }
        self.stop_background_purge();

        let worker = PurgeWorker::spawn(Arc::downgrade(&self.inner), interval)?;
        *self.inner.worker.lock() = Some(worker);
        tracing::debug!(cache = %self.inner.name, ?interval, "Background purge started");
        Ok(())
    }

    pub fn stop_background_purge(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            tracing::debug!(cache = %self.inner.name, "Background purge stopped");
        }
    }

    /// One worker pass; `None` when the settings select nothing
    fn background_pass(&self) -> Result<Option<PurgeStats>> {
        let (timeout, retention) = {
            let state = self.inner.lock_state()?;
            state.writable()?;
            (state.settings.timeout, state.settings.retention)
        };
        // never truncate from the background
        if timeout == 0 && retention != VersionRetention::DropOlder {
            return Ok(None);
        }
        self.purge(timeout, retention).map(Some)
    }
}

/// Errors that end only the current batch under `PurgeErrorPolicy::Continue`
fn is_batch_error(err: &CacheError) -> bool {
    !matches!(
        err,
        CacheError::Closed | CacheError::ReadOnly | CacheError::LockTimeout
    )
}

/// Periodic purge thread, holding only a weak reference to the cache
pub(crate) struct PurgeWorker {
    /// Dropping the sender wakes the worker and ends it
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PurgeWorker {
    fn spawn(inner: Weak<CacheInner>, interval: Duration) -> Result<Self> {
        let (shutdown, signal) = channel::bounded(1);
        let handle = thread::Builder::new()
            .name("motecache-purge".to_string())
            .spawn(move || run_purge_loop(inner, interval, signal))?;
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub(crate) fn signal_stop(&mut self) {
        self.shutdown.take();
    }

    fn stop(mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            // the worker itself may end up closing the cache
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Purge worker panicked");
            }
        }
    }
}

fn run_purge_loop(inner: Weak<CacheInner>, interval: Duration, shutdown: Receiver<()>) {
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let cache = BlobCache { inner };
        match cache.background_pass() {
            Ok(Some(stats)) => {
                tracing::debug!(removed = stats.removed, scanned = stats.scanned, "Background purge pass")
            }
            Ok(None) => {}
            Err(CacheError::Closed) => break,
            Err(e) => tracing::warn!(error = %e, "Background purge pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::types::ManualClock;
    use std::time::Instant;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000;

    fn open(dir: &TempDir, config: impl FnOnce(CacheConfig) -> CacheConfig) -> (BlobCache, ManualClock) {
        let clock = ManualClock::new(T0);
        let config = config(CacheConfig::for_testing(dir.path()).with_retention(VersionRetention::KeepAll));
        let cache = BlobCache::open_with_clock(config, Arc::new(clock.clone())).unwrap();
        (cache, clock)
    }

    fn present(cache: &BlobCache, key: &str, version: i32, subkey: &str) -> bool {
        let mut buf = Vec::new();
        cache.read(key, version, subkey, &mut buf).unwrap()
    }

    #[test]
    fn test_purge_expired() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = open(&dir, |c| c.with_policy(TimeStampPolicy::empty(), 0));
        cache.store("old", 1, "", b"a").unwrap();
        clock.set(T0 + 150);
        cache.store("new", 1, "", b"b").unwrap();

        clock.set(T0 + 200);
        let stats = cache.purge(100, VersionRetention::KeepAll).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(!present(&cache, "old", 1, ""));
        assert!(present(&cache, "new", 1, ""));

        // idempotent
        let again = cache.purge(100, VersionRetention::KeepAll).unwrap();
        assert_eq!(again.removed, 0);
        assert!(present(&cache, "new", 1, ""));
        cache.close().unwrap();
    }

    #[test]
    fn test_purge_drop_older() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |c| c);
        for version in 1..=3 {
            cache.store("k", version, "", b"v").unwrap();
        }
        cache.store("other", 1, "", b"v").unwrap();

        let stats = cache.purge(0, VersionRetention::DropOlder).unwrap();
        assert_eq!(stats.removed, 2);
        assert!(!present(&cache, "k", 1, ""));
        assert!(!present(&cache, "k", 2, ""));
        assert!(present(&cache, "k", 3, ""));
        assert!(present(&cache, "other", 1, ""));
        cache.close().unwrap();
    }

    #[test]
    fn test_drop_older_groups_span_batches() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |mut c| {
            c.purge_batch_size = 1;
            c
        });
        for version in 1..=4 {
            cache.store("k", version, "s", b"v").unwrap();
        }
        cache.store("z", 7, "", b"v").unwrap();

        let stats = cache.purge(0, VersionRetention::DropOlder).unwrap();
        assert_eq!(stats.removed, 3);
        assert!(stats.batches > 3);
        assert!(present(&cache, "k", 4, "s"));
        assert!(!present(&cache, "k", 3, "s"));
        assert!(present(&cache, "z", 7, ""));
        cache.close().unwrap();
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |c| c.with_inline_threshold(16));
        cache.store("small", 1, "", b"x").unwrap();
        cache.store("big", 1, "sub", &[1u8; 64]).unwrap();

        let stats = cache.purge(0, VersionRetention::DropAll).unwrap();
        assert!(stats.truncated);
        assert_eq!(stats.files_removed, 1);
        assert!(!present(&cache, "small", 1, ""));
        assert!(!present(&cache, "big", 1, "sub"));

        let after = cache.stats().unwrap();
        assert_eq!(after.blob_rows, 0);
        assert_eq!(after.attribute_rows, 0);
        assert_eq!(after.overflow_files, 0);

        // empty key in a scoped purge means the whole cache
        cache.store("again", 1, "", b"x").unwrap();
        assert!(cache.purge_key("", "", 0, VersionRetention::DropAll).unwrap().truncated);
        assert!(!present(&cache, "again", 1, ""));
        cache.close().unwrap();
    }

    #[test]
    fn test_purge_key_scoped() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |c| c);
        cache.store("k", 1, "a", b"1").unwrap();
        cache.store("k", 2, "a", b"2").unwrap();
        cache.store("k", 1, "b", b"3").unwrap();
        cache.store("j", 1, "a", b"4").unwrap();

        let stats = cache.purge_key("k", "a", 0, VersionRetention::DropOlder).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(!present(&cache, "k", 1, "a"));
        assert!(present(&cache, "k", 2, "a"));
        // b is the newest version of its own subkey
        assert!(present(&cache, "k", 1, "b"));

        cache.purge_key("k", "", 0, VersionRetention::DropAll).unwrap();
        assert!(!present(&cache, "k", 2, "a"));
        assert!(!present(&cache, "k", 1, "b"));
        assert!(present(&cache, "j", 1, "a"));
        assert_eq!(cache.stats().unwrap().attribute_rows, 2);
        cache.close().unwrap();
    }

    #[test]
    fn test_stop_flag() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |mut c| {
            c.purge_batch_size = 1;
            c
        });
        for version in 1..=5 {
            cache.store("k", version, "", b"v").unwrap();
        }

        cache.stop_purge();
        let stats = cache.purge(0, VersionRetention::DropOlder).unwrap();
        assert!(stats.stopped);
        assert_eq!(stats.removed, 0);
        assert!(present(&cache, "k", 1, ""));

        // the request is consumed by the run it stopped
        let stats = cache.purge(0, VersionRetention::DropOlder).unwrap();
        assert!(!stats.stopped);
        assert_eq!(stats.removed, 4);
        cache.close().unwrap();
    }

    #[test]
    fn test_purge_yields_lock_between_batches() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = open(&dir, |mut c| {
            c.purge_batch_size = 1;
            c.purge_batch_sleep_ms = 20;
            c.lock_timeout_ms = 200;
            c
        });
        for key in 0..10 {
            for version in 1..=3 {
                cache.store(&format!("k{}", key), version, "", b"v").unwrap();
            }
        }

        let purging = {
            let cache = cache.clone();
            thread::spawn(move || cache.purge(0, VersionRetention::DropOlder))
        };
        thread::sleep(Duration::from_millis(50));

        // well inside the purge, which sleeps 20ms after each of its 50 batches;
        // a purge holding the lock throughout would time these out
        cache.store("fg", 1, "", b"foreground").unwrap();
        let mut buf = Vec::new();
        assert!(cache.read("fg", 1, "", &mut buf).unwrap());
        assert_eq!(buf, b"foreground");
        assert!(!purging.is_finished());

        let stats = purging.join().unwrap().unwrap();
        assert_eq!(stats.removed, 20);
        assert!(present(&cache, "fg", 1, ""));
        assert!(present(&cache, "k9", 3, ""));
        cache.close().unwrap();
    }

    #[test]
    fn test_lfu_counts_deferred_access() {
        let dir = TempDir::new().unwrap();
        let policy = TimeStampPolicy::TIMESTAMP_ON_READ | TimeStampPolicy::EXPIRE_LEAST_FREQUENTLY_USED;
        let (cache, clock) = open(&dir, |mut c| {
            c.read_update_limit = 10;
            c.with_policy(policy, 0)
        });
        cache.store("k", 1, "", b"v").unwrap();
        clock.set(T0 + 90);
        assert!(present(&cache, "k", 1, ""));

        clock.set(T0 + 150);
        assert_eq!(cache.purge(100, VersionRetention::KeepAll).unwrap().removed, 0);

        // without LFU only the stored stamp counts
        cache.set_timestamp_policy(TimeStampPolicy::TIMESTAMP_ON_READ, 0).unwrap();
        assert_eq!(cache.purge(100, VersionRetention::KeepAll).unwrap().removed, 1);
        cache.close().unwrap();
    }

    #[test]
    fn test_purge_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let (cache, _) = open(&dir, |c| c);
            cache.store("k", 1, "", b"v").unwrap();
            cache.close().unwrap();
        }

        // timeout 0: nothing to expire, the mount leaves the data alone
        let clock = ManualClock::new(T0 + 1000);
        let config = CacheConfig::for_testing(dir.path()).with_policy(TimeStampPolicy::PURGE_ON_STARTUP, 0);
        let cache = BlobCache::open_with_clock(config, Arc::new(clock.clone())).unwrap();
        assert!(present(&cache, "k", 1, ""));
        cache.close().unwrap();

        let config = CacheConfig::for_testing(dir.path()).with_policy(TimeStampPolicy::PURGE_ON_STARTUP, 100);
        let cache = BlobCache::open_with_clock(config, Arc::new(clock)).unwrap();
        assert!(!present(&cache, "k", 1, ""));
        assert_eq!(cache.purge_batch_size().unwrap(), CacheConfig::default().purge_batch_size);
        cache.close().unwrap();
    }

    #[test]
    fn test_background_purge() {
        let dir = TempDir::new().unwrap();
        let (cache, clock) = open(&dir, |c| c.with_policy(TimeStampPolicy::empty(), 100));
        cache.store("k", 1, "", b"v").unwrap();
        clock.set(T0 + 1000);

        cache.start_background_purge(Duration::from_millis(20)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.stats().unwrap().attribute_rows > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cache.stats().unwrap().attribute_rows, 0);

        cache.stop_background_purge();
        cache.close().unwrap();
    }

    #[test]
    fn test_read_only_refuses_purge() {
        let dir = TempDir::new().unwrap();
        {
            let (cache, _) = open(&dir, |c| c);
            cache.store("k", 1, "", b"v").unwrap();
            cache.close().unwrap();
        }
        let cache = BlobCache::open_read_only(CacheConfig::for_testing(dir.path())).unwrap();
        assert!(matches!(
            cache.purge(10, VersionRetention::KeepAll),
            Err(CacheError::ReadOnly)
        ));
        assert!(matches!(
            cache.start_background_purge(Duration::from_secs(1)),
            Err(CacheError::ReadOnly)
        ));
        cache.close().unwrap();
    }
}
