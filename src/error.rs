//! Error types for the MoteCache BLOB cache

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] heed::Error),

    /// The environment could not be opened, even after one recovery attempt
    #[error("Cannot open cache store: {0}")]
    StoreOpen(String),

    /// Environment join failed in a way that calls for recovery
    #[error("Store recovery required: {0}")]
    RecoveryRequired(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Mutating call on a read-only cache")]
    ReadOnly,

    #[error("Cache is not open")]
    Closed,

    #[error("Timed out waiting for the cache lock")]
    LockTimeout,

    #[error("Cache directory is locked by process {pid}")]
    Locked { pid: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),
}

impl From<bincode::Error> for CacheError {
    fn from(err: bincode::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl CacheError {
    /// Whether a failed environment join should be retried with recovery.
    ///
    /// LMDB reports a damaged or stale region as one of a handful of codes;
    /// everything else (permissions, missing directory) will not improve by
    /// dropping the region file.
    pub fn needs_recovery(&self) -> bool {
        match self {
            CacheError::RecoveryRequired(_) => true,
            CacheError::Store(heed::Error::Mdb(code)) => matches!(
                code,
                heed::MdbError::Corrupted
                    | heed::MdbError::Panic
                    | heed::MdbError::VersionMismatch
                    | heed::MdbError::Invalid
            ),
            _ => false,
        }
    }

    /// Convert a recovery-class store error into the explicit variant
    pub(crate) fn classify_join(self) -> Self {
        if self.needs_recovery() {
            match self {
                CacheError::RecoveryRequired(msg) => CacheError::RecoveryRequired(msg),
                other => CacheError::RecoveryRequired(other.to_string()),
            }
        } else {
            self
        }
    }
}
