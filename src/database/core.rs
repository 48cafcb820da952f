//! Cache Core - BlobCache structure, mount and unmount
//!
//! This module contains:
//! - `BlobCache` and the shared `CacheInner` behind it
//! - open() / open_read_only() / close()
//! - policy setters and getters
//! - statistics
//!
//! All operations serialize on one cache-wide lock (`CacheInner::state`).
//! Purge is the only caller that releases it voluntarily, between batches.

use crate::cache::{AccessCache, AccessCacheStats};
use crate::config::{CacheConfig, LockMode, WriteSyncMode};
use crate::database::purge::{PurgeErrorPolicy, PurgeWorker};
use crate::storage::tables::{attribute_table_name, blob_table_name};
use crate::storage::{AttributeTable, BlobTable, OverflowFiles};
use crate::txn::{
    open_environment, release_environment, with_read_txn, with_transaction, OpenKind, PidLock,
    SharedEnv,
};
use crate::types::{CacheKey, Clock, SystemClock, TimeStampPolicy, Timestamp, VersionRetention};
use crate::{CacheError, Result};
use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};
use parking_lot::{Mutex, MutexGuard};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache statistics snapshot
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub name: String,
    pub open: bool,
    pub read_only: bool,
    pub stores: u64,
    pub reads: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub removes: u64,
    pub purged: u64,
    pub commits: u64,
    pub aborts: u64,
    /// Rows in the blob table (inline payloads)
    pub blob_rows: u64,
    /// Rows in the attribute table, probes included
    pub attribute_rows: u64,
    pub overflow_files: usize,
    pub access_cache: AccessCacheStats,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) stores: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) read_hits: AtomicU64,
    pub(crate) read_misses: AtomicU64,
    pub(crate) removes: AtomicU64,
    pub(crate) purged: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Mutable policy knobs, changed through the setters
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub(crate) policy: TimeStampPolicy,
    pub(crate) timeout: u64,
    pub(crate) retention: VersionRetention,
    pub(crate) batch_size: usize,
    pub(crate) batch_sleep: Duration,
    pub(crate) error_policy: PurgeErrorPolicy,
    pub(crate) write_sync: WriteSyncMode,
    pub(crate) inline_threshold: usize,
    pub(crate) eager_read_limit: usize,
}

impl Settings {
    fn from_config(config: &CacheConfig) -> Self {
        Self {
            policy: config.timestamp_policy,
            timeout: config.timeout,
            retention: config.version_retention,
            batch_size: config.purge_batch_size.max(1),
            batch_sleep: config.batch_sleep(),
            error_policy: PurgeErrorPolicy::default(),
            write_sync: config.write_sync,
            inline_threshold: config.inline_threshold,
            eager_read_limit: config.eager_read_limit,
        }
    }

    pub(crate) fn track_subkey(&self) -> bool {
        self.policy.track_subkey()
    }

    /// Key under which access time is tracked
    pub(crate) fn access_key(&self, key: &CacheKey) -> CacheKey {
        if self.track_subkey() {
            key.clone()
        } else {
            key.probe()
        }
    }
}

/// Handles of a mounted cache
pub(crate) struct OpenStore {
    pub(crate) shared: Arc<SharedEnv>,
    pub(crate) blobs: BlobTable,
    pub(crate) attrs: AttributeTable,
    pub(crate) files: OverflowFiles,
    pub(crate) pid_lock: Option<PidLock>,
    pub(crate) lock_mode: LockMode,
    pub(crate) read_only: bool,
}

impl OpenStore {
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            Err(CacheError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// One write transaction over both tables
    pub(crate) fn transaction<T, F>(&self, sync: WriteSyncMode, f: F) -> Result<T>
    where
        F: FnOnce(&mut RwTxn) -> Result<T>,
    {
        self.ensure_writable()?;
        with_transaction(&self.shared, sync, f)
    }

    pub(crate) fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&RoTxn) -> Result<T>,
    {
        with_read_txn(&self.shared, f)
    }

    /// Remove blob row and attributes of one entry (inside a transaction).
    ///
    /// Overflow files go after the commit, see [`OpenStore::drop_files`].
    pub(crate) fn drop_entry(&self, txn: &mut RwTxn, key: &CacheKey) -> Result<()> {
        self.blobs.delete(txn, key)?;
        self.attrs.delete_entry(txn, key)?;
        Ok(())
    }

    /// Delete the overflow files of committed removals; failures leave an
    /// orphan file behind and are only logged
    pub(crate) fn drop_files<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) {
        for key in keys {
            let path = self.files.path_for_key(key);
            if let Err(e) = self.files.delete(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Overflow file left behind");
            }
        }
    }
}

pub(crate) struct CacheState {
    pub(crate) store: Option<OpenStore>,
    pub(crate) settings: Settings,
    pub(crate) access: AccessCache,
}

impl CacheState {
    pub(crate) fn store(&self) -> Result<&OpenStore> {
        self.store.as_ref().ok_or(CacheError::Closed)
    }

    /// Store handle for mutating calls
    pub(crate) fn writable(&self) -> Result<&OpenStore> {
        let store = self.store()?;
        store.ensure_writable()?;
        Ok(store)
    }
}

/// Shared part of a cache, referenced by the façade, streams and the purge worker
pub(crate) struct CacheInner {
    pub(crate) name: String,
    pub(crate) path: PathBuf,
    pub(crate) files: OverflowFiles,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) stop_purge: AtomicBool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) lock_timeout: Duration,
    pub(crate) counters: Counters,
    pub(crate) worker: Mutex<Option<PurgeWorker>>,
}

impl CacheInner {
    /// Take the cache-wide lock, bounded by the configured lock timeout
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or(CacheError::LockTimeout)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().as_mut() {
            worker.signal_stop();
        }
        let state = self.state.get_mut();
        if let Some(store) = state.store.take() {
            if let Err(e) = unmount(store, &mut state.access, state.settings.write_sync) {
                tracing::error!(cache = %self.name, error = %e, "Unmount on drop failed");
            }
        }
    }
}

/// Disk-backed transactional BLOB cache
///
/// # Quick start
///
/// ```no_run
/// use motecache::{BlobCache, CacheConfig};
///
/// let cache = BlobCache::open(CacheConfig::new("/var/cache/blobs", "main"))?;
/// cache.store("doc1", 1, "", b"payload")?;
///
/// let mut buf = Vec::new();
/// assert!(cache.read("doc1", 1, "", &mut buf)?);
/// cache.close()?;
/// # Ok::<(), motecache::CacheError>(())
/// ```
///
/// Clones share one mounted instance.
#[derive(Clone)]
pub struct BlobCache {
    pub(crate) inner: Arc<CacheInner>,
}

impl BlobCache {
    // ==================== Mount / Unmount ====================

    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Mount read-only: no locking, no recovery, mutating calls fail with `ReadOnly`
    pub fn open_read_only(mut config: CacheConfig) -> Result<Self> {
        config.read_only = true;
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Mount with an explicit time source
    pub fn open_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        // 1. Environment: join, recover or create
        let opened = open_environment(&config)?;
        let kind = opened.kind;

        // 2. Tables
        let tables = open_tables(&opened.shared, &config.name, config.read_only);
        let (blobs, attrs) = match tables {
            Ok(tables) => tables,
            Err(e) => {
                drop(opened.pid_lock);
                if let Err(release_err) = release_environment(opened.shared, false) {
                    tracing::warn!(error = %release_err, "Release after failed mount failed");
                }
                return Err(e);
            }
        };

        let files = OverflowFiles::new(&config.path, &config.name);
        let store = OpenStore {
            shared: opened.shared,
            blobs,
            attrs,
            files: files.clone(),
            pid_lock: opened.pid_lock,
            lock_mode: config.lock_mode,
            read_only: config.read_only,
        };

        let settings = Settings::from_config(&config);
        let cache = BlobCache {
            inner: Arc::new(CacheInner {
                name: config.name.clone(),
                path: config.path.clone(),
                files,
                state: Mutex::new(CacheState {
                    store: Some(store),
                    settings,
                    access: AccessCache::new(config.read_update_limit),
                }),
                stop_purge: AtomicBool::new(false),
                clock,
                lock_timeout: config.lock_timeout(),
                counters: Counters::default(),
                worker: Mutex::new(None),
            }),
        };

        tracing::info!(
            cache = %config.name,
            path = %config.path.display(),
            read_only = config.read_only,
            recovered = kind == OpenKind::Recovered,
            "Cache mounted"
        );

        // 3. Purge on open, favoring speed since callers wait on it
        if !config.read_only
            && settings.policy.contains(TimeStampPolicy::PURGE_ON_STARTUP)
            && settings.timeout > 0
        {
            cache.purge_on_open()?;
        }

        Ok(cache)
    }

    /// Flush access times, release locks and the environment.
    ///
    /// Idempotent; every later call reports absence or `Closed`.
    pub fn close(&self) -> Result<()> {
        self.stop_background_purge();

        let mut state = self.inner.lock_state()?;
        let write_sync = state.settings.write_sync;
        let CacheState { store, access, .. } = &mut *state;
        let Some(store) = store.take() else {
            return Ok(());
        };
        unmount(store, access, write_sync)?;
        tracing::info!(cache = %self.inner.name, "Cache unmounted");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().store.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner
            .state
            .lock()
            .store
            .as_ref()
            .map(|s| s.read_only)
            .unwrap_or(false)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // ==================== Policies ====================

    /// Set the time-stamp policy and the expiration timeout (seconds)
    pub fn set_timestamp_policy(&self, policy: TimeStampPolicy, timeout: u64) -> Result<()> {
        let mut state = self.inner.lock_state()?;
        state.settings.policy = policy;
        state.settings.timeout = timeout;
        Ok(())
    }

    pub fn timestamp_policy(&self) -> Result<TimeStampPolicy> {
        Ok(self.inner.lock_state()?.settings.policy)
    }

    pub fn timeout(&self) -> Result<u64> {
        Ok(self.inner.lock_state()?.settings.timeout)
    }

    pub fn set_version_retention(&self, retention: VersionRetention) -> Result<()> {
        self.inner.lock_state()?.settings.retention = retention;
        Ok(())
    }

    pub fn version_retention(&self) -> Result<VersionRetention> {
        Ok(self.inner.lock_state()?.settings.retention)
    }

    pub fn set_purge_batch_size(&self, batch_size: usize) -> Result<()> {
        self.inner.lock_state()?.settings.batch_size = batch_size.max(1);
        Ok(())
    }

    pub fn purge_batch_size(&self) -> Result<usize> {
        Ok(self.inner.lock_state()?.settings.batch_size)
    }

    pub fn set_batch_sleep(&self, sleep: Duration) -> Result<()> {
        self.inner.lock_state()?.settings.batch_sleep = sleep;
        Ok(())
    }

    pub fn batch_sleep(&self) -> Result<Duration> {
        Ok(self.inner.lock_state()?.settings.batch_sleep)
    }

    pub fn set_purge_error_policy(&self, policy: PurgeErrorPolicy) -> Result<()> {
        self.inner.lock_state()?.settings.error_policy = policy;
        Ok(())
    }

    pub fn set_write_sync(&self, mode: WriteSyncMode) -> Result<()> {
        self.inner.lock_state()?.settings.write_sync = mode;
        Ok(())
    }

    /// Resize the access-time cache; shrinking below the current size flushes it
    pub fn set_read_update_limit(&self, limit: usize) -> Result<()> {
        let mut state = self.inner.lock_state()?;
        let write_sync = state.settings.write_sync;
        let CacheState { store, access, .. } = &mut *state;
        access.set_limit(limit);
        if !access.is_empty() && (limit == 0 || access.len() >= limit) {
            if let Some(store) = store.as_ref() {
                flush_access_cache(store, access, write_sync)?;
            }
        }
        Ok(())
    }

    // ==================== Statistics ====================

    pub fn stats(&self) -> Result<CacheStats> {
        let state = self.inner.lock_state()?;
        let counters = &self.inner.counters;
        let mut stats = CacheStats {
            name: self.inner.name.clone(),
            open: state.store.is_some(),
            stores: counters.stores.load(Ordering::Relaxed),
            reads: counters.reads.load(Ordering::Relaxed),
            read_hits: counters.read_hits.load(Ordering::Relaxed),
            read_misses: counters.read_misses.load(Ordering::Relaxed),
            removes: counters.removes.load(Ordering::Relaxed),
            purged: counters.purged.load(Ordering::Relaxed),
            access_cache: state.access.stats(),
            ..Default::default()
        };

        if let Some(store) = state.store.as_ref() {
            stats.read_only = store.read_only;
            stats.commits = store.shared.commits();
            stats.aborts = store.shared.aborts();
            let (blob_rows, attribute_rows) =
                store.read(|txn| Ok((store.blobs.len(txn)?, store.attrs.len(txn)?)))?;
            stats.blob_rows = blob_rows;
            stats.attribute_rows = attribute_rows;
            stats.overflow_files = store.files.list()?.len();
        }
        Ok(stats)
    }
}

/// Write every deferred access time in one transaction
pub(crate) fn flush_access_cache(
    store: &OpenStore,
    access: &mut AccessCache,
    write_sync: WriteSyncMode,
) -> Result<usize> {
    if access.is_empty() || store.read_only {
        return Ok(0);
    }
    let count = store.transaction(write_sync, |txn| {
        access.dump_to_store(|key, ts| {
            store.attrs.touch_existing(txn, key, ts)?;
            Ok(())
        })
    })?;
    access.mark_flushed(count);
    tracing::debug!(entries = count, "Access times flushed");
    Ok(count)
}

/// Close sequence: flush access cache, drop PID lock, release environment
fn unmount(store: OpenStore, access: &mut AccessCache, write_sync: WriteSyncMode) -> Result<()> {
    if let Err(e) = flush_access_cache(&store, access, write_sync) {
        tracing::warn!(error = %e, "Access-time flush on close failed");
    }
    access.clear();

    let OpenStore {
        shared,
        pid_lock,
        lock_mode,
        read_only,
        ..
    } = store;
    let exclusive = !read_only && (pid_lock.is_some() || lock_mode == LockMode::NoLock);
    drop(pid_lock);
    release_environment(shared, exclusive)
}

fn open_tables(
    shared: &SharedEnv,
    name: &str,
    read_only: bool,
) -> Result<(BlobTable, AttributeTable)> {
    let blob_name = blob_table_name(name);
    let attr_name = attribute_table_name(name);

    if read_only || shared.is_read_only() {
        let (blobs, attrs) = with_read_txn(shared, |txn| {
            let blobs: Option<Database<Bytes, Bytes>> =
                shared.env().open_database(txn, Some(blob_name.as_str()))?;
            let attrs: Option<Database<Bytes, Bytes>> =
                shared.env().open_database(txn, Some(attr_name.as_str()))?;
            Ok((blobs, attrs))
        })?;
        return match (blobs, attrs) {
            (Some(blobs), Some(attrs)) => Ok((BlobTable::new(blobs), AttributeTable::new(attrs))),
            _ => Err(CacheError::StoreOpen(format!(
                "tables of cache '{}' do not exist",
                name
            ))),
        };
    }

    with_transaction(shared, WriteSyncMode::WriteSync, |txn| {
        let blobs: Database<Bytes, Bytes> = shared.env().create_database(txn, Some(blob_name.as_str()))?;
        let attrs: Database<Bytes, Bytes> = shared.env().create_database(txn, Some(attr_name.as_str()))?;
        Ok((BlobTable::new(blobs), AttributeTable::new(attrs)))
    })
}
