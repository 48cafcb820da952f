//! Time stamps and clocks
//!
//! Cache time stamps are whole seconds since the Unix epoch, the same
//! resolution the attribute table stores. All expiration math goes through a
//! [`Clock`] so tests can move time explicitly instead of sleeping.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since Unix epoch
pub type Timestamp = u64;

/// Source of "now" for the cache
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Manually driven clock, shared by clones
#[derive(Debug, Clone)]
pub struct ManualClock {
    secs: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            secs: Arc::new(AtomicU64::new(start)),
        }
    }

    pub fn set(&self, secs: Timestamp) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.secs.load(Ordering::SeqCst)
    }
}

/// Expiration rule shared by reads and purge: `now - timeout > stamp`.
///
/// A zero timeout never expires anything.
pub fn is_expired(now: Timestamp, timeout: u64, stamp: Timestamp) -> bool {
    timeout != 0 && now.saturating_sub(timeout) > stamp
}
