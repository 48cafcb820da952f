//! Shared store environment
//!
//! One LMDB environment per cache directory, shared by every cache instance
//! (distinct name) living there. Inside a process the environment is handed
//! out from a registry of weak references, so a second instance "joins" the
//! live handle instead of re-opening the files.
//!
//! ## Open
//! 1. `lock.mdb` present: join the existing environment. If that fails with
//!    a recovery-class error, drop the stale region file and open once more.
//! 2. `lock.mdb` absent: create a fresh environment.
//! 3. A second consecutive failure is [`CacheError::StoreOpen`].
//!
//! Read-only opens skip locking and recovery entirely.

use crate::config::{CacheConfig, LockMode};
use crate::txn::lock_manager::PidLock;
use crate::types::{Clock, SystemClock};
use crate::{CacheError, Result};
use ahash::AHashMap;
use heed::{Env, EnvFlags, EnvOpenOptions};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// LMDB region file; its presence marks a live or unclean environment
pub const REGION_FILE: &str = "lock.mdb";

const MAX_DBS: u32 = 128;

type Registry = Mutex<AHashMap<PathBuf, Weak<SharedEnv>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(AHashMap::new()))
}

/// How the environment was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Created from scratch
    Created,
    /// Joined existing files on disk
    Joined,
    /// Joined after removing a stale region file
    Recovered,
    /// Reused a live handle from this process
    Reused,
}

/// Environment handle shared by the cache instances of one directory
pub struct SharedEnv {
    env: Env,
    path: PathBuf,
    read_only: bool,
    /// Forced syncs after commit are honored
    durable: bool,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl fmt::Debug for SharedEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEnv")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("durable", &self.durable)
            .finish()
    }
}

impl SharedEnv {
    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Flush committed data to disk
    pub fn force_sync(&self) -> Result<()> {
        if self.read_only || !self.durable {
            return Ok(());
        }
        self.env.force_sync()?;
        Ok(())
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    /// Whether `dir` currently has a live handle in this process
    pub fn is_live(dir: &Path) -> bool {
        let Ok(key) = dir.canonicalize() else {
            return false;
        };
        registry()
            .lock()
            .get(&key)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}

/// Result of [`open_environment`]
#[derive(Debug)]
pub struct OpenedEnv {
    pub shared: Arc<SharedEnv>,
    pub pid_lock: Option<PidLock>,
    pub kind: OpenKind,
}

/// Open, join or recover the environment for a cache instance
pub fn open_environment(config: &CacheConfig) -> Result<OpenedEnv> {
    let dir = &config.path;
    if !config.read_only {
        fs::create_dir_all(dir).map_err(|e| {
            CacheError::StoreOpen(format!("cannot create {}: {}", dir.display(), e))
        })?;
    }
    let key = dir
        .canonicalize()
        .map_err(|e| CacheError::StoreOpen(format!("{}: {}", dir.display(), e)))?;

    let mut registry = registry().lock();
    registry.retain(|_, weak| weak.strong_count() > 0);

    if let Some(live) = registry.get(&key).and_then(Weak::upgrade) {
        if live.read_only && !config.read_only {
            return Err(CacheError::StoreOpen(format!(
                "{} is open read-only in this process",
                key.display()
            )));
        }
        let pid_lock = take_pid_lock(config)?;
        tracing::debug!(cache = %config.name, path = %key.display(), "Joined live environment");
        return Ok(OpenedEnv {
            shared: live,
            pid_lock,
            kind: OpenKind::Reused,
        });
    }

    if config.read_only {
        let env = open_env(&key, config).map_err(|e| {
            CacheError::StoreOpen(format!("read-only open of {}: {}", key.display(), e))
        })?;
        let shared = share(env, &key, config);
        registry.insert(key, Arc::downgrade(&shared));
        return Ok(OpenedEnv {
            shared,
            pid_lock: None,
            kind: OpenKind::Joined,
        });
    }

    let pid_lock = take_pid_lock(config)?;
    let region = key.join(REGION_FILE);

    let (env, kind) = if region.exists() {
        match open_env(&key, config).map_err(CacheError::classify_join) {
            Ok(env) => (env, OpenKind::Joined),
            Err(CacheError::RecoveryRequired(reason)) => {
                tracing::warn!(cache = %config.name, path = %key.display(), %reason, "Join failed, running recovery");
                append_error_log(dir, &config.name, &format!("join failed, recovering: {}", reason));

                remove_region_file(&key)?;
                let env = open_env(&key, config).map_err(|e| {
                    let msg = format!("recovery open of {} failed: {}", key.display(), e);
                    append_error_log(dir, &config.name, &msg);
                    CacheError::StoreOpen(msg)
                })?;
                (env, OpenKind::Recovered)
            }
            Err(e) => {
                let msg = format!("join of {} failed: {}", key.display(), e);
                append_error_log(dir, &config.name, &msg);
                return Err(CacheError::StoreOpen(msg));
            }
        }
    } else {
        let env = open_env(&key, config).map_err(|e| {
            let msg = format!("create of {} failed: {}", key.display(), e);
            append_error_log(dir, &config.name, &msg);
            CacheError::StoreOpen(msg)
        })?;
        (env, OpenKind::Created)
    };

    let shared = share(env, &key, config);
    registry.insert(key, Arc::downgrade(&shared));
    tracing::info!(
        cache = %config.name,
        path = %shared.path.display(),
        kind = ?kind,
        map_size = config.effective_map_size(),
        mem_size = config.mem_size,
        "Environment opened"
    );

    Ok(OpenedEnv {
        shared,
        pid_lock,
        kind,
    })
}

/// Release one reference to the environment.
///
/// The last in-process reference closes the environment. The region file is
/// removed only when `exclusive` says no other process can be using it.
pub fn release_environment(shared: Arc<SharedEnv>, exclusive: bool) -> Result<()> {
    if let Err(e) = shared.force_sync() {
        tracing::warn!(path = %shared.path.display(), error = %e, "Sync on close failed");
    }

    let mut registry = registry().lock();
    let path = shared.path.clone();
    let read_only = shared.read_only;

    match Arc::try_unwrap(shared) {
        Ok(last) => {
            registry.remove(&path);
            last.env.prepare_for_closing().wait();

            if read_only {
                return Ok(());
            }
            if exclusive {
                remove_region_file(&path)?;
                tracing::debug!(path = %path.display(), "Environment removed");
            } else {
                tracing::warn!(path = %path.display(), "Environment may be shared with another process, leaving region file");
            }
        }
        Err(_still_shared) => {
            tracing::warn!(path = %path.display(), "Environment still in use, skipping removal");
        }
    }
    Ok(())
}

/// Open an environment directly, bypassing the registry (offline tools)
pub(crate) fn open_detached(dir: &Path, config: &CacheConfig) -> Result<Env> {
    open_env(dir, config)
}

fn open_env(dir: &Path, config: &CacheConfig) -> Result<Env> {
    let mut flags = EnvFlags::empty();
    if config.read_only {
        flags |= EnvFlags::READ_ONLY;
    } else {
        // commits are made durable explicitly, see SharedEnv::force_sync
        flags |= EnvFlags::NO_SYNC;
        if !config.use_transactions {
            flags |= EnvFlags::NO_META_SYNC;
        }
    }

    let mut options = EnvOpenOptions::new();
    options.map_size(config.effective_map_size()).max_dbs(MAX_DBS);
    let env = unsafe {
        options.flags(flags);
        options.open(dir)?
    };
    Ok(env)
}

fn share(env: Env, path: &Path, config: &CacheConfig) -> Arc<SharedEnv> {
    Arc::new(SharedEnv {
        env,
        path: path.to_path_buf(),
        read_only: config.read_only,
        durable: config.use_transactions,
        commits: AtomicU64::new(0),
        aborts: AtomicU64::new(0),
    })
}

fn take_pid_lock(config: &CacheConfig) -> Result<Option<PidLock>> {
    if config.read_only || config.lock_mode == LockMode::NoLock {
        return Ok(None);
    }
    PidLock::acquire(&config.path, &config.name).map(Some)
}

pub(crate) fn remove_region_file(dir: &Path) -> Result<()> {
    match fs::remove_file(dir.join(REGION_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::Io(e)),
    }
}

/// Path of the per-instance error log
pub fn error_log_path(dir: &Path, cache_name: &str) -> PathBuf {
    dir.join(format!("err{}.log", cache_name))
}

/// Append one line to `err<name>.log`; failures are only traced
pub fn append_error_log(dir: &Path, cache_name: &str, message: &str) {
    let path = error_log_path(dir, cache_name);
    let line = format!("{} {}\n", SystemClock.now(), message);
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Cannot write error log");
    }
}
