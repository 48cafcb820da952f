//! MoteCache BLOB Cache
//!
//! Disk-backed transactional cache for binary blobs addressed by
//! (key, version, subkey).
//!
//! ## Core features
//! - Small blobs inline in an LMDB table, large blobs in overflow files
//! - Time-stamp based expiration, read-time or by purge
//! - Version retention: keep all, drop older, drop all
//! - Batched purge that yields the cache lock between batches
//! - Deferred access-time updates
//! - Streaming readers and writers
//!
//! ## Architecture
//! - Storage layer: blob table + attribute table + overflow files
//! - Transaction layer: shared environment registry, transaction guard, PID lock
//! - Cache layer: in-memory access-time write-back map
//! - Façade: `BlobCache` (CRUD, streams, purge, verify)
//!
//! ## Quick start
//!
//! ```no_run
//! use motecache::{BlobCache, CacheConfig, TimeStampPolicy, VersionRetention};
//!
//! let config = CacheConfig::new("/var/cache/seq", "annotations")
//!     .with_policy(TimeStampPolicy::default(), 24 * 3600)
//!     .with_retention(VersionRetention::DropOlder);
//! let cache = BlobCache::open(config)?;
//!
//! cache.store("NC_000001", 11, "", b"...")?;
//! let mut buf = Vec::new();
//! if cache.read("NC_000001", 11, "", &mut buf)? {
//!     println!("{} bytes", buf.len());
//! }
//! cache.close()?;
//! # Ok::<(), motecache::CacheError>(())
//! ```

pub mod config;
pub mod storage;
pub mod txn;
pub mod types;
pub mod cache;

// BlobCache façade (core, crud, stream, purge, verify)
pub mod database;

mod error;
mod api;

pub use config::{CacheConfig, LockMode, PageSize, WriteSyncMode};
pub use error::{CacheError, Result};

// Main public API
pub use database::{
    BlobCache, CacheReader, CacheStats, CacheWriter, PurgeErrorPolicy, PurgeStats, ReaderKind,
    VerifyIssue, VerifyReport,
};
pub use api::BlobStore;
pub use cache::AccessCacheStats;
pub use types::{CacheKey, Clock, ManualClock, SystemClock, TimeStampPolicy, Timestamp, VersionRetention};
