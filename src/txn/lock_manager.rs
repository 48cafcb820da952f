//! Single-process advisory lock
//!
//! Under [`LockMode::PidLock`](crate::config::LockMode) a cache instance holds
//! an exclusive `flock` on `lcs_<name>.pid` for as long as it is open. The
//! kernel drops the lock when the owner exits, so a file left behind by a
//! dead process never blocks an open. The PID written into the file is for
//! diagnostics only.
//!
//! The file itself is never unlinked: removing it while another process has
//! it open would let two owners lock two different inodes.

use crate::{CacheError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Held PID lock; released when dropped
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
    file: File,
}

impl PidLock {
    pub fn file_path(dir: &Path, cache_name: &str) -> PathBuf {
        dir.join(format!("lcs_{}.pid", cache_name))
    }

    /// Take the lock without blocking
    ///
    /// Fails with [`CacheError::Locked`] carrying the recorded owner PID
    /// (0 when the file does not name one) if another handle holds it.
    pub fn acquire(dir: &Path, cache_name: &str) -> Result<Self> {
        let path = Self::file_path(dir, cache_name);
        let pid = std::process::id();

        // no truncate: the current owner's PID must survive a refused open
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                let owner = Self::owner(&path)?.unwrap_or(0);
                tracing::debug!(path = %path.display(), owner, "PID lock held elsewhere");
                return Err(CacheError::Locked { pid: owner });
            }
            Err(e) => return Err(CacheError::Io(e)),
        }

        file.set_len(0)?;
        file.write_all(format!("{}\n", pid).as_bytes())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), pid, "PID lock acquired");
        Ok(Self { path, pid, file })
    }

    /// PID recorded in a lock file, if the file exists and parses
    pub fn owner(path: &Path) -> Result<Option<u32>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // closing the handle releases the lock as well; unlock explicitly to log failures
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release PID lock");
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = PidLock::file_path(dir.path(), "main");
        {
            let lock = PidLock::acquire(dir.path(), "main").unwrap();
            assert_eq!(lock.path(), path.as_path());
            assert_eq!(PidLock::owner(&path).unwrap(), Some(std::process::id()));
        }
        // released: the next owner gets it even though the file remains
        assert!(path.exists());
        let again = PidLock::acquire(dir.path(), "main").unwrap();
        assert_eq!(again.pid(), std::process::id());
    }

    #[test]
    fn test_second_acquire_refused() {
        let dir = TempDir::new().unwrap();
        let _lock = PidLock::acquire(dir.path(), "main").unwrap();
        let err = PidLock::acquire(dir.path(), "main").unwrap_err();
        assert!(matches!(err, CacheError::Locked { pid } if pid == std::process::id()));

        // other names are independent
        let _other = PidLock::acquire(dir.path(), "other").unwrap();
    }

    #[test]
    fn test_refused_open_keeps_owner_pid() {
        let dir = TempDir::new().unwrap();
        let path = PidLock::file_path(dir.path(), "main");
        let _lock = PidLock::acquire(dir.path(), "main").unwrap();

        for _ in 0..3 {
            assert!(PidLock::acquire(dir.path(), "main").is_err());
        }
        assert_eq!(PidLock::owner(&path).unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_leftover_file_does_not_block() {
        let dir = TempDir::new().unwrap();
        let path = PidLock::file_path(dir.path(), "main");
        // an unlocked file naming some other process, e.g. after a crash
        fs::write(&path, "4242424\n").unwrap();

        let lock = PidLock::acquire(dir.path(), "main").unwrap();
        assert_eq!(PidLock::owner(&path).unwrap(), Some(lock.pid()));
    }

    #[test]
    fn test_garbage_lock_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = PidLock::file_path(dir.path(), "main");
        fs::write(&path, "not a pid, and longer than any pid line").unwrap();

        let lock = PidLock::acquire(dir.path(), "main").unwrap();
        assert_eq!(PidLock::owner(&path).unwrap(), Some(lock.pid()));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    PidLock::acquire(&root, "main")
                })
            })
            .collect();

        // winners are kept alive until every thread has tried
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, CacheError::Locked { .. })));
    }
}
