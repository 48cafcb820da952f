//! In-memory caches in front of the store

pub mod access_cache;

pub use access_cache::{AccessCache, AccessCacheStats};
