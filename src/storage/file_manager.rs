//! Overflow File Manager
//!
//! Blobs at or above the inline threshold live in standalone files next to
//! the store. Every code path (write, read, size, delete, truncate sweep)
//! derives the file name through [`OverflowFiles::path_for`], so a file
//! written by one path is always found by the others.
//!
//! ## Naming
//! `lcs_<cache name>_<sha256 hex of key/version/subkey>.ov_`
//!
//! Hashing keeps names of fixed length and free of path separators whatever
//! the key contains.

use crate::types::CacheKey;
use crate::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Fixed suffix of every overflow file
pub const OVERFLOW_SUFFIX: &str = ".ov_";

/// Appended to an overflow path while its payload is staged
pub const STAGING_SUFFIX: &str = ".tmp";

const HASH_HEX_LEN: usize = 64;

/// Overflow files of one cache instance
#[derive(Debug, Clone)]
pub struct OverflowFiles {
    /// Cache directory
    root: PathBuf,

    /// `lcs_<name>_`
    prefix: String,
}

impl OverflowFiles {
    pub fn new(root: impl Into<PathBuf>, cache_name: &str) -> Self {
        Self {
            root: root.into(),
            prefix: format!("lcs_{}_", cache_name),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic file path for a cache entry (no I/O)
    pub fn path_for(&self, key: &str, version: i32, subkey: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(version.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(subkey.as_bytes());
        let digest = hex::encode(hasher.finalize());

        self.root
            .join(format!("{}{}{}", self.prefix, digest, OVERFLOW_SUFFIX))
    }

    pub fn path_for_key(&self, cache_key: &CacheKey) -> PathBuf {
        self.path_for(&cache_key.key, cache_key.version, &cache_key.subkey)
    }

    /// Open for truncate + write. The directory must already exist.
    pub fn create(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(CacheError::Io)
    }

    /// Sibling path a new payload is written to before it replaces `path`
    pub fn staging_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(STAGING_SUFFIX);
        PathBuf::from(name)
    }

    /// Move a staged payload over its final path
    pub fn persist(&self, staged: &Path, path: &Path) -> Result<()> {
        fs::rename(staged, path).map_err(CacheError::Io)
    }

    /// Open read-only; a missing file is `NotFound`
    pub fn open_read(&self, path: &Path) -> Result<File> {
        File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(path.display().to_string()),
            _ => CacheError::Io(e),
        })
    }

    /// Delete a file; absence is not an error
    pub fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// File length without opening a stream
    pub fn size(&self, path: &Path) -> Result<u64> {
        fs::metadata(path).map(|m| m.len()).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound(path.display().to_string()),
            _ => CacheError::Io(e),
        })
    }

    /// Whether a directory entry name belongs to this cache
    pub fn is_own_file(&self, file_name: &str) -> bool {
        file_name
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_suffix(OVERFLOW_SUFFIX))
            .map(|digest| digest.len() == HASH_HEX_LEN && digest.bytes().all(|b| b.is_ascii_hexdigit()))
            .unwrap_or(false)
    }

    /// All overflow files of this cache currently on disk
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        self.scan(|name| self.is_own_file(name))
    }

    /// Staged payloads left behind by an interrupted store
    pub fn list_staged(&self) -> Result<Vec<PathBuf>> {
        self.scan(|name| {
            name.strip_suffix(STAGING_SUFFIX)
                .map_or(false, |name| self.is_own_file(name))
        })
    }

    fn scan(&self, wanted: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.root.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if wanted(name) {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }

    /// Delete every overflow file of this cache; returns how many went away.
    /// Staged leftovers are removed too but not counted.
    pub fn sweep(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.list()? {
            self.delete(&path)?;
            removed += 1;
        }
        for path in self.list_staged()? {
            self.delete(&path)?;
        }
        Ok(removed)
    }
}
