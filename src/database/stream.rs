//! Streaming access: `CacheReader` and `CacheWriter`
//!
//! Readers pick one backend when they are created and keep it:
//! - Buffer: small inline blobs, loaded eagerly
//! - File: overflow payloads
//! - Cursor: larger inline blobs, copied out of the blob table one chunk per
//!   lock acquisition
//!
//! Writers buffer in memory and promote to an overflow file once the payload
//! reaches the inline threshold. Attributes are written on `commit()`, or on
//! drop when the caller never committed.

use super::core::{BlobCache, CacheInner, CacheState, Counters};
use super::crud::{drop_matching, lookup_entry, touch_on_read};
use crate::storage::tables::encode_cache_key;
use crate::storage::{AttributeRecord, ChecksumBuilder};
use crate::types::{CacheKey, Timestamp};
use crate::{CacheError, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Backend behind a [`CacheReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Buffer,
    File,
    Cursor,
}

enum ReaderBackend {
    Buffer {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        file: File,
        good: bool,
    },
    Cursor {
        inner: Arc<CacheInner>,
        key: CacheKey,
        offset: u64,
        total: u64,
    },
}

/// Read stream over one cached blob
pub struct CacheReader {
    backend: ReaderBackend,
}

impl fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheReader")
            .field("kind", &self.kind())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CacheReader {
    fn buffer(data: Vec<u8>) -> Self {
        Self {
            backend: ReaderBackend::Buffer { data, pos: 0 },
        }
    }

    fn file(file: File) -> Self {
        Self {
            backend: ReaderBackend::File { file, good: true },
        }
    }

    fn cursor(inner: Arc<CacheInner>, key: CacheKey, total: u64) -> Self {
        Self {
            backend: ReaderBackend::Cursor {
                inner,
                key,
                offset: 0,
                total,
            },
        }
    }

    pub fn kind(&self) -> ReaderKind {
        match self.backend {
            ReaderBackend::Buffer { .. } => ReaderKind::Buffer,
            ReaderBackend::File { .. } => ReaderKind::File,
            ReaderBackend::Cursor { .. } => ReaderKind::Cursor,
        }
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` is end of stream
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.backend {
            ReaderBackend::Buffer { data, pos } => {
                let n = buf.len().min(data.len() - *pos);
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            ReaderBackend::File { file, good } => {
                if !*good {
                    return Ok(0);
                }
                match file.read(buf) {
                    Ok(0) => {
                        *good = false;
                        Ok(0)
                    }
                    Ok(n) => Ok(n),
                    Err(e) => {
                        *good = false;
                        Err(CacheError::Io(e))
                    }
                }
            }
            ReaderBackend::Cursor {
                inner,
                key,
                offset,
                total,
            } => {
                if *offset >= *total {
                    return Ok(0);
                }
                let state = inner.lock_state()?;
                let store = state.store()?;
                let chunk = store.read(|txn| store.blobs.read_at(txn, key, *offset, buf))?;
                match chunk {
                    Some((n, len)) => {
                        *offset += n as u64;
                        *total = len;
                        Ok(n)
                    }
                    None => {
                        *total = *offset;
                        Err(CacheError::NotFound(key.to_string()))
                    }
                }
            }
        }
    }

    /// Remaining bytes for buffer and cursor streams; for file streams only
    /// whether the file is still readable (0 or 1)
    pub fn pending_count(&self) -> u64 {
        match &self.backend {
            ReaderBackend::Buffer { data, pos } => (data.len() - pos) as u64,
            ReaderBackend::File { good, .. } => u64::from(*good),
            ReaderBackend::Cursor { offset, total, .. } => total.saturating_sub(*offset),
        }
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(into_io)
    }
}

/// Write stream for one cache entry
pub struct CacheWriter {
    inner: Arc<CacheInner>,
    key: CacheKey,
    threshold: usize,
    buffer: Vec<u8>,
    file: Option<BufWriter<File>>,
    path: PathBuf,
    checksum: ChecksumBuilder,
    committed: bool,
}

impl fmt::Debug for CacheWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWriter")
            .field("key", &self.key)
            .field("len", &self.checksum.len())
            .field("overflow", &self.file.is_some())
            .field("committed", &self.committed)
            .finish()
    }
}

impl CacheWriter {
    fn new(inner: Arc<CacheInner>, key: CacheKey, threshold: usize) -> Self {
        let path = inner.files.path_for_key(&key);
        Self {
            inner,
            key,
            threshold,
            buffer: Vec::new(),
            file: None,
            path,
            checksum: ChecksumBuilder::new(),
            committed: false,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.checksum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksum.is_empty()
    }

    pub fn is_overflow(&self) -> bool {
        self.file.is_some()
    }

    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.committed = false;

        if self.file.is_none() && self.buffer.len() + data.len() >= self.threshold {
            self.promote()?;
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(data)?,
            None => self.buffer.extend_from_slice(data),
        }
        self.checksum.update(data);
        Ok(())
    }

    /// Move the buffered bytes into a new overflow file
    fn promote(&mut self) -> Result<()> {
        let mut file = BufWriter::new(self.inner.files.create(&self.path)?);
        file.write_all(&self.buffer)?;
        self.buffer = Vec::new();
        self.file = Some(file);
        tracing::trace!(key = %self.key, "Write stream promoted to overflow file");
        Ok(())
    }

    /// Publish the payload: blob row (inline) or file, then attributes
    pub fn commit(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        let overflow = self.file.is_some();
        let now = self.inner.now();

        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;

        let record = AttributeRecord::entry(now, overflow, self.checksum.len(), self.checksum.finalize());
        let track_subkey = settings.track_subkey();
        let (key, buffer) = (&self.key, &self.buffer);
        store.transaction(settings.write_sync, |txn| {
            if overflow {
                store.blobs.delete(txn, key)?;
            } else {
                store.blobs.put(txn, key, buffer)?;
            }
            store.attrs.put_entry(txn, key, record, track_subkey)
        })?;

        // only this entry's deferred stamp is stale; siblings keep theirs
        access.remove_entry(&settings.access_key(&self.key));
        self.committed = true;
        Counters::bump(&self.inner.counters.stores, 1);
        tracing::trace!(key = %self.key, size = record.size, overflow, "Write stream committed");
        Ok(())
    }

    /// Drop the stream without publishing anything
    pub fn discard(mut self) -> Result<()> {
        self.committed = true;
        self.file = None;
        self.inner.files.delete(&self.path)
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf).map_err(into_io)?;
        Ok(buf.len())
    }

    /// Pushes file buffers down; publishing is `commit()`
    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.commit() {
            tracing::error!(key = %self.key, error = %e, "Write stream commit on drop failed");
            if self.file.take().is_some() {
                if let Err(e) = self.inner.files.delete(&self.path) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Overflow cleanup failed");
                }
            }
        }
    }
}

fn into_io(err: CacheError) -> io::Error {
    match err {
        CacheError::Io(e) => e,
        CacheError::NotFound(what) => io::Error::new(io::ErrorKind::NotFound, what),
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

enum ReaderSource {
    Buffer(Vec<u8>),
    File,
    Cursor(u64),
}

impl BlobCache {
    // ==================== Streams ====================

    /// Open a read stream; `None` when absent, expired or unreadable
    pub fn get_read_stream(&self, key: &str, version: i32, subkey: &str) -> Result<Option<CacheReader>> {
        let cache_key = CacheKey::new(key, version, subkey);
        let now = self.inner.now();
        let mut state = self.inner.lock_state()?;
        Counters::bump(&self.inner.counters.reads, 1);

        match self.open_reader(&state, &cache_key, now) {
            Ok(Some(reader)) => {
                Counters::bump(&self.inner.counters.read_hits, 1);
                touch_on_read(&mut state, &cache_key, now);
                Ok(Some(reader))
            }
            Ok(None) => {
                Counters::bump(&self.inner.counters.read_misses, 1);
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(key = %cache_key, error = %e, "Read stream unavailable");
                Counters::bump(&self.inner.counters.read_misses, 1);
                Ok(None)
            }
        }
    }

    fn open_reader(&self, state: &CacheState, key: &CacheKey, now: Timestamp) -> Result<Option<CacheReader>> {
        let store = state.store()?;
        let eager_limit = state.settings.eager_read_limit;
        let source = store.read(|txn| {
            let Some(record) = lookup_entry(store, txn, &state.settings, &state.access, key, now)? else {
                return Ok(None);
            };
            if record.overflow {
                return Ok(Some(ReaderSource::File));
            }
            match store.blobs.get(txn, key)? {
                Some(data) if data.len() <= eager_limit => Ok(Some(ReaderSource::Buffer(data.to_vec()))),
                Some(data) => Ok(Some(ReaderSource::Cursor(data.len() as u64))),
                None => Err(CacheError::NotFound(key.to_string())),
            }
        })?;

        Ok(match source {
            None => None,
            Some(ReaderSource::Buffer(data)) => Some(CacheReader::buffer(data)),
            Some(ReaderSource::File) => {
                let file = store.files.open_read(&store.files.path_for_key(key))?;
                Some(CacheReader::file(file))
            }
            Some(ReaderSource::Cursor(total)) => {
                Some(CacheReader::cursor(self.inner.clone(), key.clone(), total))
            }
        })
    }

    /// Open a write stream, dropping whatever is stored under the entry.
    ///
    /// Retention applies as in `store`; the exact entry is always dropped so
    /// the last writer wins.
    pub fn get_write_stream(&self, key: &str, version: i32, subkey: &str) -> Result<CacheWriter> {
        let cache_key = CacheKey::new(key, version, subkey);
        let mut state = self.inner.lock_state()?;
        let CacheState {
            store,
            settings,
            access,
        } = &mut *state;
        let store = store.as_ref().ok_or(CacheError::Closed)?;
        store.ensure_writable()?;
        encode_cache_key(&cache_key)?;

        if settings.retention.drops_on_store() {
            drop_matching(store, settings, access, key, subkey)?;
        }
        store.transaction(settings.write_sync, |txn| store.drop_entry(txn, &cache_key))?;
        store.files.delete(&store.files.path_for_key(&cache_key))?;
        access.remove_entry(&settings.access_key(&cache_key));

        Ok(CacheWriter::new(self.inner.clone(), cache_key, settings.inline_threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::types::VersionRetention;
    use rand::RngCore;
    use tempfile::TempDir;

    fn open(dir: &TempDir, threshold: usize, eager: usize) -> BlobCache {
        let mut config = CacheConfig::for_testing(dir.path())
            .with_inline_threshold(threshold)
            .with_retention(VersionRetention::KeepAll);
        config.eager_read_limit = eager;
        BlobCache::open(config).unwrap()
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    fn drain(reader: &mut CacheReader, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read_chunk(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_reader_backends() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1024, 100);
        let small = random_bytes(50);
        let medium = random_bytes(500);
        let large = random_bytes(4000);
        cache.store("small", 1, "", &small).unwrap();
        cache.store("medium", 1, "", &medium).unwrap();
        cache.store("large", 1, "", &large).unwrap();

        let mut reader = cache.get_read_stream("small", 1, "").unwrap().unwrap();
        assert_eq!(reader.kind(), ReaderKind::Buffer);
        assert_eq!(reader.pending_count(), 50);
        assert_eq!(drain(&mut reader, 7), small);
        assert_eq!(reader.pending_count(), 0);

        let mut reader = cache.get_read_stream("medium", 1, "").unwrap().unwrap();
        assert_eq!(reader.kind(), ReaderKind::Cursor);
        assert_eq!(reader.pending_count(), 500);
        assert_eq!(drain(&mut reader, 64), medium);
        assert_eq!(reader.pending_count(), 0);

        let mut reader = cache.get_read_stream("large", 1, "").unwrap().unwrap();
        assert_eq!(reader.kind(), ReaderKind::File);
        assert_eq!(reader.pending_count(), 1);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, large);
        assert_eq!(reader.read_chunk(&mut [0u8; 8]).unwrap(), 0);
        assert_eq!(reader.pending_count(), 0);

        assert!(cache.get_read_stream("missing", 1, "").unwrap().is_none());
        cache.close().unwrap();
    }

    #[test]
    fn test_cursor_reader_sees_removal() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1024, 10);
        cache.store("k", 1, "", &random_bytes(200)).unwrap();

        let mut reader = cache.get_read_stream("k", 1, "").unwrap().unwrap();
        let mut buf = [0u8; 50];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 50);
        cache.remove("k").unwrap();
        assert!(matches!(reader.read_chunk(&mut buf), Err(CacheError::NotFound(_))));
        assert_eq!(reader.pending_count(), 0);
        cache.close().unwrap();
    }

    #[test]
    fn test_writer_inline() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1024, 1024);
        let mut writer = cache.get_write_stream("k", 1, "sub").unwrap();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert!(!writer.is_overflow());
        writer.commit().unwrap();
        drop(writer);

        let mut buf = Vec::new();
        assert!(cache.read("k", 1, "sub", &mut buf).unwrap());
        assert_eq!(buf, b"hello world");
        assert_eq!(cache.get_size("k", 1, "sub").unwrap(), 11);
        cache.close().unwrap();
    }

    #[test]
    fn test_writer_promotes_to_file() {
        let dir = TempDir::new().unwrap();
        let threshold = 256;
        let cache = open(&dir, threshold, 1024);
        let data = random_bytes(1000);

        let mut writer = cache.get_write_stream("k", 1, "").unwrap();
        for chunk in data.chunks(100) {
            writer.write_all(chunk).unwrap();
        }
        assert!(writer.is_overflow());
        assert_eq!(writer.len(), 1000);
        writer.commit().unwrap();
        drop(writer);

        assert!(cache.inner.files.path_for("k", 1, "").exists());
        let mut reader = cache.get_read_stream("k", 1, "").unwrap().unwrap();
        assert_eq!(reader.kind(), ReaderKind::File);
        assert_eq!(drain(&mut reader, 333), data);
        cache.close().unwrap();
    }

    #[test]
    fn test_writer_exact_threshold_promotes() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 64, 1024);
        let mut writer = cache.get_write_stream("k", 1, "").unwrap();
        writer.write_all(&[1u8; 63]).unwrap();
        assert!(!writer.is_overflow());
        writer.write_all(&[2u8; 1]).unwrap();
        assert!(writer.is_overflow());
        writer.commit().unwrap();
        drop(writer);
        assert_eq!(cache.get_size("k", 1, "").unwrap(), 64);
        cache.close().unwrap();
    }

    #[test]
    fn test_writer_commits_on_drop() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 1024, 1024);
        {
            let mut writer = cache.get_write_stream("k", 1, "").unwrap();
            writer.write_all(b"dropped, not lost").unwrap();
        }
        let mut buf = Vec::new();
        assert!(cache.read("k", 1, "", &mut buf).unwrap());
        assert_eq!(buf, b"dropped, not lost");
        cache.close().unwrap();
    }

    #[test]
    fn test_writer_discard() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 16, 1024);
        let mut writer = cache.get_write_stream("k", 1, "").unwrap();
        writer.write_all(&[0u8; 100]).unwrap();
        writer.discard().unwrap();

        assert!(!cache.inner.files.path_for("k", 1, "").exists());
        assert_eq!(cache.get_size("k", 1, "").unwrap(), 0);
        cache.close().unwrap();
    }

    #[test]
    fn test_write_stream_replaces_entry() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir, 32, 1024);
        cache.store("k", 1, "", &[9u8; 100]).unwrap();
        assert!(cache.inner.files.path_for("k", 1, "").exists());

        let mut writer = cache.get_write_stream("k", 1, "").unwrap();
        // the old payload is gone as soon as the writer exists
        assert_eq!(cache.get_size("k", 1, "").unwrap(), 0);
        writer.write_all(b"short").unwrap();
        writer.commit().unwrap();
        drop(writer);

        assert!(!cache.inner.files.path_for("k", 1, "").exists());
        let mut buf = Vec::new();
        assert!(cache.read("k", 1, "", &mut buf).unwrap());
        assert_eq!(buf, b"short");
        cache.close().unwrap();
    }

    #[test]
    fn test_write_stream_read_only() {
        let dir = TempDir::new().unwrap();
        open(&dir, 1024, 1024).close().unwrap();
        let cache = BlobCache::open_read_only(CacheConfig::for_testing(dir.path())).unwrap();
        assert!(matches!(cache.get_write_stream("k", 1, ""), Err(CacheError::ReadOnly)));
        cache.close().unwrap();
    }
}
