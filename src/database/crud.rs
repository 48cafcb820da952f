//! CRUD Operations Module
//!
//! Store, Read, GetSize, Remove and GetAccessTime.
//!
//! Read-style calls fail closed: a miss, an expired entry, a closed cache or
//! a failed fetch all come back as `false`, `0` or `None`. Only a lock
//! timeout is reported as an error.

use super::core::{flush_access_cache, BlobCache, CacheState, Counters, OpenStore, Settings};
use crate::cache::AccessCache;
use crate::storage::{AttributeRecord, Checksum};
use crate::types::{is_expired, CacheKey, TimeStampPolicy, Timestamp};
use crate::{CacheError, Result};
use heed::RoTxn;
use std::io::{Read, Write};
use std::path::Path;

/// Attribute lookup with expiration applied (the probe carries the
/// key/version stamp when subkeys are not tracked)
pub(crate) fn lookup_entry(
    store: &OpenStore,
    txn: &RoTxn,
    settings: &Settings,
    access: &AccessCache,
    key: &CacheKey,
    now: Timestamp,
) -> Result<Option<AttributeRecord>> {
    let Some(record) = store.attrs.get(txn, key)? else {
        return Ok(None);
    };
    if record.probe {
        return Ok(None);
    }

    let stamp = if settings.track_subkey() || key.subkey.is_empty() {
        record.time_stamp
    } else {
        match store.attrs.get(txn, &key.probe())? {
            Some(probe) => probe.time_stamp.max(record.time_stamp),
            None => return Ok(None),
        }
    };

    if settings.policy.contains(TimeStampPolicy::CHECK_EXPIRATION_ALWAYS) {
        let stamp = access
            .peek(&settings.access_key(key))
            .map_or(stamp, |mem| mem.max(stamp));
        if is_expired(now, settings.timeout, stamp) {
            tracing::debug!(key = %key, "Entry expired");
            return Ok(None);
        }
    }
    Ok(Some(record))
}

/// Record a successful read under the time-stamp-on-read policy
pub(crate) fn touch_on_read(state: &mut CacheState, key: &CacheKey, now: Timestamp) {
    let CacheState {
        store,
        settings,
        access,
    } = state;
    let Some(store) = store.as_ref() else {
        return;
    };
    if store.read_only || !settings.policy.contains(TimeStampPolicy::TIMESTAMP_ON_READ) {
        return;
    }

    let access_key = settings.access_key(key);
    let result = if access.is_active() {
        let flushed = if access.is_limit_reached() {
            flush_access_cache(store, access, settings.write_sync).map(|_| ())
        } else {
            Ok(())
        };
        access.record_access(access_key, now);
        flushed
    } else {
        store.transaction(settings.write_sync, |txn| store.attrs.touch(txn, &access_key, now))
    };
    if let Err(e) = result {
        tracing::warn!(key = %key, error = %e, "Access time update failed");
    }
}

/// Selection used by Store and scoped purge: every entry of `key` whose
/// subkey matches (`""` matches all)
pub(crate) fn drop_matching(
    store: &OpenStore,
    settings: &Settings,
    access: &mut AccessCache,
    key: &str,
    subkey: &str,
) -> Result<usize> {
    let rows = store.read(|txn| store.attrs.rows_for(txn, key))?;
    let doomed: Vec<_> = rows
        .into_iter()
        .filter(|row| subkey.is_empty() || row.key.subkey == subkey)
        .collect();
    if doomed.is_empty() {
        return Ok(0);
    }

    store.transaction(settings.write_sync, |txn| {
        for row in &doomed {
            store.drop_entry(txn, &row.key)?;
        }
        Ok(())
    })?;
    store.drop_files(doomed.iter().filter(|row| row.record.overflow).map(|row| &row.key));
    for row in &doomed {
        access.remove_entry(&row.key);
    }
    Ok(doomed.len())
}

fn write_staged(store: &OpenStore, staged: &Path, data: &[u8]) -> Result<()> {
    let mut file = store.files.create(staged)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

fn discard_staged(store: &OpenStore, staged: &Path) {
    if let Err(e) = store.files.delete(staged) {
        tracing::warn!(path = %staged.display(), error = %e, "Staged overflow cleanup failed");
    }
}

impl BlobCache {
    // ==================== Store ====================

    /// Store a blob.
    ///
    /// With `DropOlder`/`DropAll` retention every existing entry of
    /// (key, subkey) is dropped first, so Store is not a plain upsert.
    pub fn store(&self, key: &str, version: i32, subkey: &str, data: &[u8]) -> Result<()> {
        let cache_key = CacheKey::new(key, version, subkey);
        let now = self.inner.now();

        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;
        store.ensure_writable()?;
        crate::storage::tables::encode_cache_key(&cache_key)?;

        // 1. Version retention
        if settings.retention.drops_on_store() {
            drop_matching(store, settings, access, key, subkey)?;
        }

        // 2. Payload: overflow bytes are staged beside the final path, which
        //    keeps the previous payload intact until the transaction commits
        let overflow = data.len() >= settings.inline_threshold;
        let path = store.files.path_for_key(&cache_key);
        let staged = overflow.then(|| store.files.staging_path(&path));
        if let Some(staged) = &staged {
            if let Err(e) = write_staged(store, staged, data) {
                discard_staged(store, staged);
                return Err(e);
            }
        }

        // 3. Blob row and attributes in one transaction
        let record = AttributeRecord::entry(now, overflow, data.len() as u64, Checksum::compute(data));
        let track_subkey = settings.track_subkey();
        let result = store.transaction(settings.write_sync, |txn| {
            if overflow {
                store.blobs.delete(txn, &cache_key)?;
            } else {
                store.blobs.put(txn, &cache_key, data)?;
            }
            store.attrs.put_entry(txn, &cache_key, record, track_subkey)
        });
        if let Err(e) = result {
            if let Some(staged) = &staged {
                discard_staged(store, staged);
            }
            return Err(e);
        }

        // 4. Committed: move the staged payload in, or drop a now stale file
        match &staged {
            Some(staged) => {
                if let Err(e) = store.files.persist(staged, &path) {
                    tracing::error!(key = %cache_key, error = %e, "Overflow payload not persisted, dropping entry");
                    discard_staged(store, staged);
                    if let Err(undo) =
                        store.transaction(settings.write_sync, |txn| store.drop_entry(txn, &cache_key))
                    {
                        tracing::error!(key = %cache_key, error = %undo, "Failed to drop unpersisted entry");
                    }
                    store.drop_files([&cache_key]);
                    access.remove_entry(&settings.access_key(&cache_key));
                    return Err(e);
                }
            }
            None => store.files.delete(&path)?,
        }

        // 5. The deferred access time of this entry is stale
        access.remove_entry(&settings.access_key(&cache_key));
        Counters::bump(&self.inner.counters.stores, 1);
        tracing::trace!(key = %cache_key, size = data.len(), overflow, "Stored");
        Ok(())
    }

    // ==================== Read ====================

    /// Copy a blob into `buf` (cleared first). `false` when absent or expired.
    pub fn read(&self, key: &str, version: i32, subkey: &str, buf: &mut Vec<u8>) -> Result<bool> {
        let cache_key = CacheKey::new(key, version, subkey);
        let now = self.inner.now();
        let mut state = self.inner.lock_state()?;
        Counters::bump(&self.inner.counters.reads, 1);
        buf.clear();

        match self.fetch(&state, &cache_key, now, buf) {
            Ok(true) => {
                Counters::bump(&self.inner.counters.read_hits, 1);
                touch_on_read(&mut state, &cache_key, now);
                Ok(true)
            }
            Ok(false) => {
                Counters::bump(&self.inner.counters.read_misses, 1);
                Ok(false)
            }
            Err(e) => {
                tracing::debug!(key = %cache_key, error = %e, "Read failed");
                Counters::bump(&self.inner.counters.read_misses, 1);
                buf.clear();
                Ok(false)
            }
        }
    }

    fn fetch(&self, state: &CacheState, key: &CacheKey, now: Timestamp, buf: &mut Vec<u8>) -> Result<bool> {
        let store = state.store()?;
        let record = store.read(|txn| {
            let Some(record) = lookup_entry(store, txn, &state.settings, &state.access, key, now)? else {
                return Ok(None);
            };
            if !record.overflow {
                match store.blobs.get(txn, key)? {
                    Some(data) => buf.extend_from_slice(data),
                    None => return Err(CacheError::NotFound(key.to_string())),
                }
            }
            Ok(Some(record))
        })?;

        match record {
            None => Ok(false),
            Some(record) if record.overflow => {
                let path = store.files.path_for_key(key);
                let mut file = store.files.open_read(&path)?;
                file.read_to_end(buf)?;
                Ok(true)
            }
            Some(_) => Ok(true),
        }
    }

    /// Whether an unexpired entry exists
    pub fn contains(&self, key: &str, version: i32, subkey: &str) -> Result<bool> {
        let cache_key = CacheKey::new(key, version, subkey);
        let now = self.inner.now();
        let state = self.inner.lock_state()?;
        let Ok(store) = state.store() else {
            return Ok(false);
        };
        let found = store.read(|txn| {
            lookup_entry(store, txn, &state.settings, &state.access, &cache_key, now)
        });
        Ok(matches!(found, Ok(Some(_))))
    }

    // ==================== Size / Access Time ====================

    /// Payload length; `0` when absent or expired
    pub fn get_size(&self, key: &str, version: i32, subkey: &str) -> Result<u64> {
        let cache_key = CacheKey::new(key, version, subkey);
        let now = self.inner.now();
        let state = self.inner.lock_state()?;
        let Ok(store) = state.store() else {
            return Ok(0);
        };

        // inline length comes from the row, overflow length from the file
        let size = store.read(|txn| {
            let Some(record) = lookup_entry(store, txn, &state.settings, &state.access, &cache_key, now)? else {
                return Ok(Some(0));
            };
            if record.overflow {
                return Ok(None);
            }
            Ok(Some(store.blobs.get(txn, &cache_key)?.map_or(0, |data| data.len() as u64)))
        });

        match size {
            Ok(Some(len)) => Ok(len),
            Ok(None) => Ok(store.files.size(&store.files.path_for_key(&cache_key)).unwrap_or(0)),
            Err(e) => {
                tracing::debug!(key = %cache_key, error = %e, "Size lookup failed");
                Ok(0)
            }
        }
    }

    /// Last access time; the in-memory value wins, `0` when unknown
    pub fn get_access_time(&self, key: &str, version: i32, subkey: &str) -> Result<Timestamp> {
        let cache_key = CacheKey::new(key, version, subkey);
        let mut state = self.inner.lock_state()?;
        let access_key = state.settings.access_key(&cache_key);

        if let Some(ts) = state.access.get_access_time(&access_key) {
            return Ok(ts);
        }
        let Ok(store) = state.store() else {
            return Ok(0);
        };
        let stamp = store.read(|txn| Ok(store.attrs.get(txn, &access_key)?.map(|r| r.time_stamp)));
        Ok(stamp.ok().flatten().unwrap_or(0))
    }

    // ==================== Remove ====================

    /// Remove every version and subkey of `key`
    pub fn remove(&self, key: &str) -> Result<()> {
        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;
        store.ensure_writable()?;

        // 1. Everything the attribute table knows about
        let rows = store.read(|txn| store.attrs.rows_for(txn, key))?;
        store.transaction(settings.write_sync, |txn| {
            for row in &rows {
                store.drop_entry(txn, &row.key)?;
            }
            Ok(())
        })?;
        store.drop_files(rows.iter().filter(|row| row.record.overflow).map(|row| &row.key));

        // 2. Blob rows that lost their attributes
        let strays = store.read(|txn| store.blobs.keys_for(txn, key))?;
        if !strays.is_empty() {
            tracing::warn!(key, count = strays.len(), "Removing blob rows without attributes");
            store.transaction(settings.write_sync, |txn| {
                for stray in &strays {
                    store.blobs.delete(txn, stray)?;
                }
                Ok(())
            })?;
        }

        access.remove(key);
        Counters::bump(&self.inner.counters.removes, 1);
        Ok(())
    }

    /// Remove one exact entry
    pub fn remove_entry(&self, key: &str, version: i32, subkey: &str) -> Result<()> {
        let cache_key = CacheKey::new(key, version, subkey);
        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;
        store.ensure_writable()?;

        let access_key = settings.access_key(&cache_key);
        let stamp_left = store.transaction(settings.write_sync, |txn| {
            store.drop_entry(txn, &cache_key)?;
            // siblings keep the shared stamp alive
            Ok(store.attrs.get(txn, &access_key)?.is_some())
        })?;
        // a file may outlive its attribute record
        store.files.delete(&store.files.path_for_key(&cache_key))?;

        if !stamp_left {
            access.remove_entry(&access_key);
        }
        Counters::bump(&self.inner.counters.removes, 1);
        Ok(())
    }
}
