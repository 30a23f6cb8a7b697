//! Rate-limited cache maintenance.
//!
//! There is no background sweeper. The write path calls
//! [`CacheCleaner::maintain`] when it has nothing else to do, and the cleaner
//! turns that into a real sweep at most once per cleanup interval.

use super::RecordWriterCache;
use crate::store::WriterFactory;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Triggers [`RecordWriterCache::clean_up`] no more than once per interval.
pub struct CacheCleaner<F: WriterFactory> {
    cache: Arc<RecordWriterCache<F>>,
    interval: Duration,
    last_sweep: Mutex<Duration>,
    attempts: AtomicU64,
    sweeps: AtomicU64,
}

impl<F: WriterFactory> CacheCleaner<F> {
    /// Create a cleaner using the cache's cleanup interval.
    ///
    /// The interval is measured from creation, so the first sweep happens one
    /// interval after the cleaner is built.
    pub fn new(cache: Arc<RecordWriterCache<F>>) -> Self {
        let interval = cache.config().cleanup_interval;
        let created = cache.now();
        Self {
            cache,
            interval,
            last_sweep: Mutex::new(created),
            attempts: AtomicU64::new(0),
            sweeps: AtomicU64::new(0),
        }
    }

    /// Sweep expired writers if the interval has elapsed since the last sweep.
    ///
    /// Returns the number of writers removed, or `None` when the call was a
    /// no-op. Concurrent callers never sweep twice for one interval.
    pub fn maintain(&self) -> Option<usize> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        {
            let mut last_sweep = self.last_sweep.lock();
            let now = self.cache.now();
            if now.saturating_sub(*last_sweep) < self.interval {
                return None;
            }
            *last_sweep = now;
        }

        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let removed = self.cache.clean_up();
        debug!(removed, remaining = self.cache.len(), "Writer cache maintenance");
        Some(removed)
    }

    /// Number of `maintain` calls.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Number of sweeps actually performed.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}
