//! Per-table writer cache.
//!
//! Writers are built lazily, one per resolved table name, and kept in a
//! bounded cache with access-based expiry:
//! - at most [`limits::CAPACITY`] live writers, least recently used evicted first
//! - writers unused for [`limits::TTL`] are released
//! - expired writers are swept by [`CacheCleaner`] at most once per
//!   [`limits::CLEANUP_INTERVAL`]
//!
//! Time is read from a monotonic [`Clock`] so tests can drive expiry
//! deterministically.

pub mod cleaner;
pub mod lru;
pub mod writer_cache;

pub use cleaner::CacheCleaner;
pub use writer_cache::{CacheStats, CacheStatsSnapshot, RecordWriterCache, WriterHandle};

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Cache sizing and timing constants.
pub mod limits {
    use std::time::Duration;

    /// Maximum live writers
    pub const CAPACITY: usize = 500;

    /// Writers unused for this long are released
    pub const TTL: Duration = Duration::from_secs(60 * 60);

    /// Minimum time between two maintenance sweeps
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
}

/// Configuration for the writer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterCacheConfig {
    /// Maximum live writers
    pub capacity: usize,
    /// Access-based time to live
    pub ttl: Duration,
    /// Minimum interval between maintenance sweeps
    pub cleanup_interval: Duration,
}

impl Default for WriterCacheConfig {
    fn default() -> Self {
        Self {
            capacity: limits::CAPACITY,
            ttl: limits::TTL,
            cleanup_interval: limits::CLEANUP_INTERVAL,
        }
    }
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin. Never decreases.
    fn now(&self) -> Duration;
}

/// Clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}
