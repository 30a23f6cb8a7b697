//! Bounded, access-expiring cache of table writers.
//!
//! The map holds either a ready entry (a slot in the access-order list) or an
//! in-flight marker for a writer that is being built. Concurrent lookups for a
//! key that is being built wait on the marker instead of building a second
//! writer; lookups for other keys are not held up, since the factory runs
//! outside the cache lock.
//!
//! Evicted writers are closed after the cache lock is released. Closing takes
//! the writer's own lock, so it waits for any write in progress on that writer.

use super::lru::LruList;
use super::{Clock, SystemClock, WriterCacheConfig};
use crate::error::{ResourceError, StoreError, WriterConstructionError};
use crate::store::{RecordWriter, WriterFactory, WriterSpec};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A cached writer.
///
/// Access to the writer is serialised. Once closed (evicted or torn down) the
/// handle refuses further writes; callers fetch a fresh handle from the cache.
pub struct WriterHandle<W> {
    id: u64,
    table: String,
    writer: Mutex<W>,
    closed: AtomicBool,
}

impl<W: RecordWriter> WriterHandle<W> {
    fn new(id: u64, table: String, writer: W) -> Self {
        Self {
            id,
            table,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    /// Construction sequence number, unique within one cache.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Table the writer is bound to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether the writer has been released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `f` with exclusive access to the writer.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> Result<R, StoreError> {
        let mut writer = self.writer.lock();
        if self.is_closed() {
            return Err(StoreError::WriterClosed(self.table.clone()));
        }
        Ok(f(&mut writer))
    }

    /// Release the writer. Returns `Ok(false)` if it was already released.
    pub fn close(&self) -> Result<bool, ResourceError> {
        let mut writer = self.writer.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        writer.close().map_err(|e| ResourceError::WriterClose {
            table: self.table.clone(),
            message: e.to_string(),
        })?;
        Ok(true)
    }
}

impl<W> fmt::Debug for WriterHandle<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterHandle")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

type Loaded<W> = Result<Arc<WriterHandle<W>>, WriterConstructionError>;

/// Construction in progress for one key.
struct InFlight<W> {
    result: Mutex<Option<Loaded<W>>>,
    ready: Condvar,
}

impl<W> InFlight<W> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Loaded<W> {
        let mut result = self.result.lock();
        loop {
            if let Some(loaded) = result.as_ref() {
                return loaded.clone();
            }
            self.ready.wait(&mut result);
        }
    }

    fn complete(&self, loaded: Loaded<W>) {
        *self.result.lock() = Some(loaded);
        self.ready.notify_all();
    }
}

enum Slot<W> {
    Ready(usize),
    Loading(Arc<InFlight<W>>),
}

struct Entry<W> {
    key: String,
    handle: Arc<WriterHandle<W>>,
    last_access: Duration,
}

struct Inner<W> {
    slots: HashMap<String, Slot<W>>,
    lru: LruList<Entry<W>>,
    next_id: u64,
}

impl<W> Inner<W> {
    fn is_loading(&self, key: &str, flight: &Arc<InFlight<W>>) -> bool {
        matches!(self.slots.get(key), Some(Slot::Loading(f)) if Arc::ptr_eq(f, flight))
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served by an existing or in-flight writer
    pub hits: AtomicU64,
    /// Lookups that started a construction
    pub misses: AtomicU64,
    /// Writers constructed
    pub constructions: AtomicU64,
    /// Failed constructions
    pub construction_failures: AtomicU64,
    /// Writers evicted to stay within capacity
    pub evictions: AtomicU64,
    /// Writers removed after their TTL
    pub expirations: AtomicU64,
    /// Writers released by invalidation
    pub invalidations: AtomicU64,
    /// Maintenance sweeps performed
    pub sweeps: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups served by an existing or in-flight writer
    pub hits: u64,
    /// Lookups that started a construction
    pub misses: u64,
    /// Writers constructed
    pub constructions: u64,
    /// Failed constructions
    pub construction_failures: u64,
    /// Capacity evictions
    pub evictions: u64,
    /// TTL expirations
    pub expirations: u64,
    /// Writers released by invalidation
    pub invalidations: u64,
    /// Maintenance sweeps
    pub sweeps: u64,
}

impl CacheStats {
    /// Get the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            constructions: self.constructions.load(Ordering::Relaxed),
            construction_failures: self.construction_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_construction(&self) {
        self.constructions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_construction_failure(&self) {
        self.construction_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_invalidations(&self, count: usize) {
        self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-table writer cache.
pub struct RecordWriterCache<F: WriterFactory> {
    factory: F,
    spec: WriterSpec,
    config: WriterCacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner<F::Writer>>,
    stats: CacheStats,
}

impl<F: WriterFactory> RecordWriterCache<F> {
    /// Create a cache with the default limits and the system clock.
    pub fn new(factory: F, spec: WriterSpec) -> Self {
        Self::with_config(
            factory,
            spec,
            WriterCacheConfig::default(),
            Arc::new(SystemClock::new()),
        )
    }

    /// Create a cache with custom limits and clock.
    pub fn with_config(
        factory: F,
        spec: WriterSpec,
        config: WriterCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            factory,
            spec,
            config,
            clock,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                lru: LruList::new(),
                next_id: 0,
            }),
            stats: CacheStats::default(),
        }
    }

    /// The writer factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Cache limits.
    pub fn config(&self) -> &WriterCacheConfig {
        &self.config
    }

    /// Cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Current time on the cache's clock.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Get the writer for `table`, building it on first use.
    ///
    /// Concurrent calls for a table that is not cached build exactly one
    /// writer; every caller receives that writer or the same construction
    /// error. Failed constructions are not cached.
    pub fn get(&self, table: &str) -> Result<Arc<WriterHandle<F::Writer>>, WriterConstructionError> {
        let mut released = Vec::new();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = self.clock.now();

        match inner.slots.get(table) {
            Some(Slot::Loading(flight)) => {
                let flight = Arc::clone(flight);
                drop(guard);
                self.stats.record_hit();
                return flight.wait();
            }
            Some(Slot::Ready(slot)) => {
                let slot = *slot;
                if let Some(entry) = inner.lru.get_mut(slot) {
                    if !self.is_expired(entry, now) {
                        entry.last_access = now;
                        let handle = Arc::clone(&entry.handle);
                        inner.lru.touch(slot);
                        self.stats.record_hit();
                        return Ok(handle);
                    }
                }
                if let Some(entry) = inner.lru.remove(slot) {
                    debug!(table, "Cached writer expired");
                    self.stats.record_expiration();
                    released.push(entry.handle);
                }
                inner.slots.remove(table);
            }
            None => {}
        }

        self.stats.record_miss();
        let flight = Arc::new(InFlight::new());
        inner
            .slots
            .insert(table.to_string(), Slot::Loading(Arc::clone(&flight)));
        drop(guard);
        self.release(released);

        let construction = Construction {
            cache: self,
            key: table,
            flight,
            finished: false,
        };
        let built = self.factory.create(table, &self.spec);
        construction.finish(built)
    }

    /// Whether a ready writer for `table` is cached. Does not refresh access.
    pub fn contains(&self, table: &str) -> bool {
        matches!(self.inner.lock().slots.get(table), Some(Slot::Ready(_)))
    }

    /// Number of ready writers.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Whether no writer is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached table names, most recently used first.
    pub fn tables(&self) -> Vec<String> {
        self.inner.lock().lru.iter().map(|e| e.key.clone()).collect()
    }

    /// Remove and release every expired writer. Returns how many were removed.
    pub fn clean_up(&self) -> usize {
        let mut released = Vec::new();
        {
            let mut guard = self.inner.lock();
            let now = self.clock.now();
            self.evict_expired(&mut guard, now, &mut released);
        }
        self.stats.record_sweep();

        let expired = released.len();
        self.release(released);
        if expired > 0 {
            debug!(expired, "Swept expired writers");
        }
        expired
    }

    /// Remove and release every cached writer. Returns how many were released.
    ///
    /// Constructions in flight are detached: their writers are released as
    /// soon as they finish and their callers receive an error.
    pub fn invalidate_all(&self) -> usize {
        let handles: Vec<_> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.slots.clear();
            inner.lru.drain().into_iter().map(|e| e.handle).collect()
        };
        self.stats.record_invalidations(handles.len());
        let released = self.release(handles);
        debug!(released, "Invalidated writer cache");
        released
    }

    fn is_expired(&self, entry: &Entry<F::Writer>, now: Duration) -> bool {
        now.saturating_sub(entry.last_access) >= self.config.ttl
    }

    fn evict_expired(
        &self,
        inner: &mut Inner<F::Writer>,
        now: Duration,
        released: &mut Vec<Arc<WriterHandle<F::Writer>>>,
    ) {
        // Access order puts the stalest entries at the back.
        while matches!(inner.lru.back(), Some((_, e)) if self.is_expired(e, now)) {
            let Some(entry) = inner.lru.pop_back() else {
                break;
            };
            inner.slots.remove(&entry.key);
            self.stats.record_expiration();
            released.push(entry.handle);
        }
    }

    fn evict_to_capacity(
        &self,
        inner: &mut Inner<F::Writer>,
        released: &mut Vec<Arc<WriterHandle<F::Writer>>>,
    ) {
        while inner.lru.len() >= self.config.capacity.max(1) {
            let Some(entry) = inner.lru.pop_back() else {
                break;
            };
            debug!(table = %entry.key, "Evicting least recently used writer");
            inner.slots.remove(&entry.key);
            self.stats.record_eviction();
            released.push(entry.handle);
        }
    }

    fn release(&self, handles: Vec<Arc<WriterHandle<F::Writer>>>) -> usize {
        let mut released = 0;
        for handle in handles {
            match handle.close() {
                Ok(true) => {
                    released += 1;
                    debug!(table = handle.table(), id = handle.id(), "Released writer");
                }
                Ok(false) => {}
                Err(e) => {
                    released += 1;
                    warn!(error = %e, "Failed to release writer");
                }
            }
        }
        released
    }
}

/// Completes an in-flight construction, including when the factory panics.
struct Construction<'a, F: WriterFactory> {
    cache: &'a RecordWriterCache<F>,
    key: &'a str,
    flight: Arc<InFlight<F::Writer>>,
    finished: bool,
}

impl<F: WriterFactory> Construction<'_, F> {
    fn finish(mut self, built: Result<F::Writer, WriterConstructionError>) -> Loaded<F::Writer> {
        self.finished = true;
        let cache = self.cache;
        let mut released = Vec::new();

        let loaded = {
            let mut guard = cache.inner.lock();
            let inner = &mut *guard;
            let current = inner.is_loading(self.key, &self.flight);

            match built {
                Ok(writer) => {
                    inner.next_id += 1;
                    let handle = Arc::new(WriterHandle::new(
                        inner.next_id,
                        self.key.to_string(),
                        writer,
                    ));
                    cache.stats.record_construction();

                    if current {
                        let now = cache.clock.now();
                        cache.evict_expired(inner, now, &mut released);
                        cache.evict_to_capacity(inner, &mut released);
                        let slot = inner.lru.push_front(Entry {
                            key: self.key.to_string(),
                            handle: Arc::clone(&handle),
                            last_access: now,
                        });
                        inner.slots.insert(self.key.to_string(), Slot::Ready(slot));
                        debug!(table = self.key, id = handle.id(), "Constructed writer");
                        Ok(handle)
                    } else {
                        released.push(handle);
                        Err(WriterConstructionError::new(
                            self.key,
                            "writer cache was invalidated during construction",
                        ))
                    }
                }
                Err(err) => {
                    if current {
                        inner.slots.remove(self.key);
                    }
                    cache.stats.record_construction_failure();
                    warn!(table = self.key, error = %err, "Writer construction failed");
                    Err(err)
                }
            }
        };

        self.flight.complete(loaded.clone());
        cache.release(released);
        loaded
    }
}

impl<F: WriterFactory> Drop for Construction<'_, F> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        {
            let mut guard = self.cache.inner.lock();
            if guard.is_loading(self.key, &self.flight) {
                guard.slots.remove(self.key);
            }
        }
        self.flight.complete(Err(WriterConstructionError::new(
            self.key,
            "writer construction panicked",
        )));
    }
}
