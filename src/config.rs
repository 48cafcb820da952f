//! Cache configuration and durability modes
//!
//! Provides the options consumed by `BlobCache::open`, either built in code,
//! deserialized from JSON, or parsed from a flat key/value parameter map.

use crate::types::{TimeStampPolicy, VersionRetention};
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Inline/overflow split point: payloads of this size or more go to files
pub const DEFAULT_INLINE_THRESHOLD: usize = 256 * 1024;

/// Inline blobs up to this size are loaded eagerly by read streams
pub const DEFAULT_EAGER_READ_LIMIT: usize = 64 * 1024;

/// Commit durability
///
/// Trades throughput for durability:
/// - WriteSync: every commit is flushed to disk before returning
/// - WriteNoSync: commits land in the OS buffers, the flush happens later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WriteSyncMode {
    WriteSync,
    #[default]
    WriteNoSync,
}

impl WriteSyncMode {
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::WriteSync)
    }
}

/// Process exclusivity for a cache directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LockMode {
    /// Caller guarantees exclusivity some other way
    #[default]
    NoLock,
    /// Take a PID file lock in the cache directory
    PidLock,
}

/// Page-size class for the blob table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PageSize {
    Small,
    /// Favors big blobs
    #[default]
    Large,
}

impl PageSize {
    /// Default map size for the environment
    pub fn default_map_size(&self) -> usize {
        match self {
            PageSize::Small => 256 * 1024 * 1024,
            PageSize::Large => 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory
    pub path: PathBuf,

    /// Instance name, used for table and file names
    pub name: String,

    pub lock_mode: LockMode,

    pub page_size: PageSize,

    /// RAM cache size hint in bytes (0 = engine default)
    pub mem_size: usize,

    /// Explicit map size; falls back to the page-size class default
    pub map_size: Option<usize>,

    pub read_only: bool,

    pub write_sync: WriteSyncMode,

    pub use_transactions: bool,

    /// Attribute records scanned or deleted per purge batch
    pub purge_batch_size: usize,

    /// Pause between purge batches, in milliseconds
    pub purge_batch_sleep_ms: u64,

    /// In-memory access-time entries before a forced flush (0 = disabled)
    pub read_update_limit: usize,

    pub timestamp_policy: TimeStampPolicy,

    /// Expiration timeout in seconds (0 = never expires)
    pub timeout: u64,

    pub version_retention: VersionRetention,

    pub inline_threshold: usize,

    pub eager_read_limit: usize,

    /// Upper bound on waiting for the cache lock
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            name: "lcache".to_string(),
            lock_mode: LockMode::NoLock,
            page_size: PageSize::Large,
            mem_size: 0,
            map_size: None,
            read_only: false,
            write_sync: WriteSyncMode::WriteNoSync,
            use_transactions: true,
            purge_batch_size: 70,
            purge_batch_sleep_ms: 0,
            read_update_limit: 0,
            timestamp_policy: TimeStampPolicy::default(),
            timeout: 0,
            version_retention: VersionRetention::DropOlder,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            eager_read_limit: DEFAULT_EAGER_READ_LIMIT,
            lock_timeout_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Small, quiet configuration for tests: no purge on open, small map
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        let mut policy = TimeStampPolicy::default();
        policy.remove(TimeStampPolicy::PURGE_ON_STARTUP);
        Self {
            path: path.into(),
            name: "test".to_string(),
            page_size: PageSize::Small,
            map_size: Some(64 * 1024 * 1024),
            timestamp_policy: policy,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_policy(mut self, policy: TimeStampPolicy, timeout: u64) -> Self {
        self.timestamp_policy = policy;
        self.timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: VersionRetention) -> Self {
        self.version_retention = retention;
        self
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    pub fn effective_map_size(&self) -> usize {
        self.map_size.unwrap_or_else(|| self.page_size.default_map_size())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn batch_sleep(&self) -> Duration {
        Duration::from_millis(self.purge_batch_sleep_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidArgument("cache name is empty".into()));
        }
        if self.name.contains(['/', '\\', '\0']) {
            return Err(CacheError::InvalidArgument(format!(
                "cache name '{}' contains a path separator",
                self.name
            )));
        }
        if self.inline_threshold == 0 {
            return Err(CacheError::InvalidArgument("inline_threshold must be positive".into()));
        }
        Ok(())
    }

    /// Build a configuration from flat string parameters.
    ///
    /// Unknown keys are ignored; malformed values are an error.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let mut config = CacheConfig::default();
        let get = |key: &str| params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        config.path = get("path")
            .map(PathBuf::from)
            .ok_or_else(|| CacheError::InvalidArgument("missing required parameter 'path'".into()))?;
        if let Some(name) = get("name") {
            config.name = name.to_string();
        }
        if let Some(lock) = get("lock") {
            config.lock_mode = if lock.eq_ignore_ascii_case("pid_lock") {
                LockMode::PidLock
            } else {
                LockMode::NoLock
            };
        }
        if let Some(page_size) = get("page_size") {
            // anything but "small" keeps the large default
            if page_size.eq_ignore_ascii_case("small") {
                config.page_size = PageSize::Small;
            }
        }
        if let Some(mem_size) = get("mem_size") {
            config.mem_size = parse_data_size("mem_size", mem_size)?;
        }
        if let Some(map_size) = get("map_size") {
            config.map_size = Some(parse_data_size("map_size", map_size)?);
        }
        if let Some(v) = get("read_only") {
            config.read_only = parse_bool("read_only", v)?;
        }
        if let Some(v) = get("write_sync") {
            config.write_sync = if parse_bool("write_sync", v)? {
                WriteSyncMode::WriteSync
            } else {
                WriteSyncMode::WriteNoSync
            };
        }
        if let Some(v) = get("use_transactions") {
            config.use_transactions = parse_bool("use_transactions", v)?;
        }
        if let Some(v) = get("purge_batch_size") {
            config.purge_batch_size = parse_int("purge_batch_size", v)?;
        }
        if let Some(v) = get("purge_batch_sleep") {
            config.purge_batch_sleep_ms = parse_int("purge_batch_sleep", v)? as u64;
        }
        if let Some(v) = get("read_update_limit") {
            config.read_update_limit = parse_int("read_update_limit", v)?;
        }
        if let Some(v) = get("timeout") {
            config.timeout = parse_int("timeout", v)? as u64;
        }
        if let Some(v) = get("timestamp") {
            config.timestamp_policy = TimeStampPolicy::parse(v).ok_or_else(|| {
                CacheError::InvalidArgument(format!("bad timestamp policy '{}'", v))
            })?;
        }
        if let Some(v) = get("keep_versions") {
            config.version_retention = VersionRetention::parse(v).ok_or_else(|| {
                CacheError::InvalidArgument(format!("bad keep_versions value '{}'", v))
            })?;
        }
        if let Some(v) = get("inline_threshold") {
            config.inline_threshold = parse_data_size("inline_threshold", v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CacheError::InvalidArgument(format!("'{}': expected a boolean, got '{}'", key, value))),
    }
}

fn parse_int(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| CacheError::InvalidArgument(format!("'{}': expected an integer, got '{}'", key, value)))
}

/// Parse sizes like `4096`, `512K`, `10MB`, `1G`
fn parse_data_size(key: &str, value: &str) -> Result<usize> {
    let upper = value.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let base = parse_int(key, digits.trim())?;
    base.checked_mul(multiplier)
        .ok_or_else(|| CacheError::InvalidArgument(format!("'{}': size '{}' overflows", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.name, "lcache");
        assert_eq!(config.purge_batch_size, 70);
        assert_eq!(config.inline_threshold, 256 * 1024);
        assert_eq!(config.write_sync, WriteSyncMode::WriteNoSync);
        assert!(config.use_transactions);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_from_params() {
        let config = CacheConfig::from_params(&params(&[
            ("path", "/tmp/cache"),
            ("name", "blobs"),
            ("lock", "PID_LOCK"),
            ("page_size", "small"),
            ("mem_size", "10M"),
            ("write_sync", "yes"),
            ("use_transactions", "false"),
            ("purge_batch_size", "20"),
            ("purge_batch_sleep", "5"),
            ("read_update_limit", "100"),
            ("timeout", "3600"),
            ("timestamp", "onread|subkey"),
            ("keep_versions", "drop_all"),
        ]))
        .unwrap();

        assert_eq!(config.path, PathBuf::from("/tmp/cache"));
        assert_eq!(config.name, "blobs");
        assert_eq!(config.lock_mode, LockMode::PidLock);
        assert_eq!(config.page_size, PageSize::Small);
        assert_eq!(config.mem_size, 10 * 1024 * 1024);
        assert_eq!(config.write_sync, WriteSyncMode::WriteSync);
        assert!(!config.use_transactions);
        assert_eq!(config.purge_batch_size, 20);
        assert_eq!(config.batch_sleep(), Duration::from_millis(5));
        assert_eq!(config.read_update_limit, 100);
        assert_eq!(config.timeout, 3600);
        assert!(config.timestamp_policy.track_subkey());
        assert_eq!(config.version_retention, VersionRetention::DropAll);
    }

    #[test]
    fn test_from_params_errors() {
        assert!(CacheConfig::from_params(&params(&[("name", "x")])).is_err());
        assert!(CacheConfig::from_params(&params(&[("path", "/tmp"), ("write_sync", "maybe")])).is_err());
        assert!(CacheConfig::from_params(&params(&[("path", "/tmp"), ("name", "a/b")])).is_err());
        assert!(CacheConfig::from_params(&params(&[("path", "/tmp"), ("timestamp", "never")])).is_err());
    }

    #[test]
    fn test_parse_data_size() {
        assert_eq!(parse_data_size("k", "4096").unwrap(), 4096);
        assert_eq!(parse_data_size("k", "512k").unwrap(), 512 * 1024);
        assert_eq!(parse_data_size("k", "10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_data_size("k", "1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_data_size("k", "lots").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let config = CacheConfig::for_testing("/tmp/x");
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "test");
        assert_eq!(back.map_size, Some(64 * 1024 * 1024));
        assert!(!back.timestamp_policy.contains(TimeStampPolicy::PURGE_ON_STARTUP));

        let partial: CacheConfig = serde_json::from_str(r#"{"name":"only"}"#).unwrap();
        assert_eq!(partial.name, "only");
        assert_eq!(partial.purge_batch_size, 70);
    }
}
