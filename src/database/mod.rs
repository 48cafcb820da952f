//! Database Module - BlobCache façade
//!
//! # Module Structure
//! - `core`: BlobCache struct, mount/unmount, policy setters, statistics
//! - `crud`: Store, Read, GetSize, GetAccessTime, Remove
//! - `stream`: read and write streams
//! - `purge`: batched purge, truncate, background purge worker
//! - `verify`: offline integrity check

pub mod core;
pub mod crud;
pub mod purge;
pub mod stream;
pub mod verify;

// Re-export main types
pub use self::core::{BlobCache, CacheStats};
pub use purge::{PurgeErrorPolicy, PurgeStats};
pub use stream::{CacheReader, CacheWriter, ReaderKind};
pub use verify::{VerifyIssue, VerifyReport};
