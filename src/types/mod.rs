//! Core cache types: addressing, policies, time

pub mod timestamp;

pub use timestamp::{is_expired, Clock, ManualClock, SystemClock, Timestamp};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Cache entry address: (key, version, subkey)
///
/// Ordered lexicographically on key, numerically on version, then
/// lexicographically on subkey. The storage key codec preserves this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub key: String,
    pub version: i32,
    pub subkey: String,
}

impl CacheKey {
    pub fn new(key: impl Into<String>, version: i32, subkey: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version,
            subkey: subkey.into(),
        }
    }

    /// Same key/version with the subkey collapsed to the empty probe slot
    pub fn probe(&self) -> Self {
        Self {
            key: self.key.clone(),
            version: self.version,
            subkey: String::new(),
        }
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then(self.version.cmp(&other.version))
            .then_with(|| self.subkey.cmp(&other.subkey))
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.key, self.version, self.subkey)
    }
}

bitflags! {
    /// Time-stamp policy flags
    ///
    /// Serialized as a `|`-separated flag list in human-readable formats.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TimeStampPolicy: u32 {
        /// Track access time per subkey instead of per key/version
        const TRACK_SUBKEY = 1 << 0;
        /// Update the access time on every successful read
        const TIMESTAMP_ON_READ = 1 << 1;
        /// Check expiration on every read-style call
        const CHECK_EXPIRATION_ALWAYS = 1 << 2;
        /// Run a purge pass while opening
        const PURGE_ON_STARTUP = 1 << 3;
        /// Purge measures age from the last access rather than the last write
        const EXPIRE_LEAST_FREQUENTLY_USED = 1 << 4;
    }
}

impl TimeStampPolicy {
    pub fn track_subkey(&self) -> bool {
        self.contains(Self::TRACK_SUBKEY)
    }

    /// Parse a flag list such as `"onread|check_expiration"`
    pub fn parse(flags: &str) -> Option<Self> {
        let mut policy = Self::empty();
        for token in flags
            .split(|c: char| c == '|' || c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            let flag = match token.to_ascii_lowercase().as_str() {
                "subkey" | "track_subkey" => Self::TRACK_SUBKEY,
                "onread" | "on_read" => Self::TIMESTAMP_ON_READ,
                "check_expiration" | "expire_check" => Self::CHECK_EXPIRATION_ALWAYS,
                "purge_on_startup" | "purge_on_open" => Self::PURGE_ON_STARTUP,
                "lfu" | "expire_lfu" => Self::EXPIRE_LEAST_FREQUENTLY_USED,
                _ => return None,
            };
            policy.insert(flag);
        }
        Some(policy)
    }
}

impl Default for TimeStampPolicy {
    fn default() -> Self {
        Self::TIMESTAMP_ON_READ | Self::EXPIRE_LEAST_FREQUENTLY_USED | Self::PURGE_ON_STARTUP
    }
}

/// Version retention policy applied when a new version is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VersionRetention {
    /// Keep every version
    KeepAll,
    /// Storing a key drops its previous versions
    #[default]
    DropOlder,
    /// Storing a key drops everything stored under it
    DropAll,
}

impl VersionRetention {
    pub fn drops_on_store(&self) -> bool {
        matches!(self, Self::DropOlder | Self::DropAll)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "all" | "keep_all" => Some(Self::KeepAll),
            "drop_old" | "drop_older" => Some(Self::DropOlder),
            "drop_all" => Some(Self::DropAll),
            _ => None,
        }
    }
}
