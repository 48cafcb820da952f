//! Collaborator API
//!
//! Code that only needs {Store, Read, Write, Remove, Purge} takes a
//! `&dyn BlobStore` instead of the concrete cache, so it can be handed a
//! test double or a cache with a different configuration.
//!
//! ```no_run
//! use motecache::{BlobCache, BlobStore, CacheConfig};
//! use std::io::Write;
//!
//! fn save_report(store: &dyn BlobStore, id: &str, body: &[u8]) -> motecache::Result<()> {
//!     let mut writer = store.write(id, 1, "report")?;
//!     writer.write_all(body)?;
//!     Ok(())
//! }
//!
//! let cache = BlobCache::open(CacheConfig::new("/var/cache/reports", "reports"))?;
//! save_report(&cache, "r-17", b"...")?;
//! # Ok::<(), motecache::CacheError>(())
//! ```

use crate::database::{BlobCache, PurgeStats};
use crate::types::VersionRetention;
use crate::Result;
use std::io::Write;

/// Generic blob store interface
pub trait BlobStore: Send + Sync {
    fn store(&self, key: &str, version: i32, subkey: &str, data: &[u8]) -> Result<()>;

    /// Fill `buf`; `false` when the entry is absent or expired
    fn read(&self, key: &str, version: i32, subkey: &str, buf: &mut Vec<u8>) -> Result<bool>;

    /// Stream a new payload; it is published when the writer is dropped
    fn write(&self, key: &str, version: i32, subkey: &str) -> Result<Box<dyn Write + Send>>;

    fn remove(&self, key: &str) -> Result<()>;

    fn purge(&self, timeout: u64, keep: VersionRetention) -> Result<PurgeStats>;

    fn read_to_vec(&self, key: &str, version: i32, subkey: &str) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        Ok(self.read(key, version, subkey, &mut buf)?.then_some(buf))
    }
}

impl BlobStore for BlobCache {
    fn store(&self, key: &str, version: i32, subkey: &str, data: &[u8]) -> Result<()> {
        BlobCache::store(self, key, version, subkey, data)
    }

    fn read(&self, key: &str, version: i32, subkey: &str, buf: &mut Vec<u8>) -> Result<bool> {
        BlobCache::read(self, key, version, subkey, buf)
    }

    fn write(&self, key: &str, version: i32, subkey: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.get_write_stream(key, version, subkey)?))
    }

    fn remove(&self, key: &str) -> Result<()> {
        BlobCache::remove(self, key)
    }

    fn purge(&self, timeout: u64, keep: VersionRetention) -> Result<PurgeStats> {
        BlobCache::purge(self, timeout, keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use tempfile::TempDir;

    fn exercise(store: &dyn BlobStore) {
        store.store("a", 1, "", b"stored").unwrap();
        {
            let mut writer = store.write("b", 1, "x").unwrap();
            writer.write_all(b"streamed").unwrap();
        }
        assert_eq!(store.read_to_vec("a", 1, "").unwrap().unwrap(), b"stored");
        assert_eq!(store.read_to_vec("b", 1, "x").unwrap().unwrap(), b"streamed");

        store.remove("a").unwrap();
        assert!(store.read_to_vec("a", 1, "").unwrap().is_none());

        store.purge(0, VersionRetention::DropAll).unwrap();
        assert!(store.read_to_vec("b", 1, "x").unwrap().is_none());
    }

    #[test]
    fn test_cache_as_blob_store() {
        let dir = TempDir::new().unwrap();
        let cache = BlobCache::open(CacheConfig::for_testing(dir.path()).with_inline_threshold(4)).unwrap();
        exercise(&cache);
        cache.close().unwrap();
    }
}
