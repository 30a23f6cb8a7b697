//! Sink metrics with Prometheus text export.

use crate::cache::CacheStatsSnapshot;
use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Batch and record counters for one sink.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Batches handed to the sink (including empty ones)
    batches_total: AtomicU64,

    /// Empty batches, each of which triggered a maintenance attempt
    empty_batches_total: AtomicU64,

    /// Batches that failed and were rolled back
    fatal_batches_total: AtomicU64,

    /// Records committed
    records_written_total: AtomicU64,

    /// Records routed to the error handler
    records_errored_total: AtomicU64,

    /// Records dropped by the unsupported-operation policy
    records_discarded_total: AtomicU64,

    /// Records committed per table
    table_written: DashMap<String, AtomicU64>,

    /// Records routed to the error handler per table
    table_errored: DashMap<String, AtomicU64>,
}

impl SinkMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch that was committed.
    pub fn record_batch(&self, written: u64, errored: u64, discarded: u64) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.records_written_total
            .fetch_add(written, Ordering::Relaxed);
        self.records_errored_total
            .fetch_add(errored, Ordering::Relaxed);
        self.records_discarded_total
            .fetch_add(discarded, Ordering::Relaxed);
    }

    /// Record an empty batch.
    pub fn record_empty_batch(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.empty_batches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch that was rolled back.
    pub fn record_fatal_batch(&self) {
        self.batches_total.fetch_add(1, Ordering::Relaxed);
        self.fatal_batches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record records committed to a table.
    pub fn record_table_written(&self, table: &str, count: u64) {
        Self::add_table(&self.table_written, table, count);
    }

    /// Record records of a table routed to the error handler.
    pub fn record_table_errored(&self, table: &str, count: u64) {
        Self::add_table(&self.table_errored, table, count);
    }

    fn add_table(map: &DashMap<String, AtomicU64>, table: &str, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(counter) = map.get(table) {
            counter.fetch_add(count, Ordering::Relaxed);
            return;
        }
        map.entry(table.to_string())
            .and_modify(|v| {
                v.fetch_add(count, Ordering::Relaxed);
            })
            .or_insert_with(|| AtomicU64::new(count));
    }

    /// Total batches.
    pub fn batches_total(&self) -> u64 {
        self.batches_total.load(Ordering::Relaxed)
    }

    /// Empty batches.
    pub fn empty_batches_total(&self) -> u64 {
        self.empty_batches_total.load(Ordering::Relaxed)
    }

    /// Rolled back batches.
    pub fn fatal_batches_total(&self) -> u64 {
        self.fatal_batches_total.load(Ordering::Relaxed)
    }

    /// Committed records.
    pub fn records_written_total(&self) -> u64 {
        self.records_written_total.load(Ordering::Relaxed)
    }

    /// Errored records.
    pub fn records_errored_total(&self) -> u64 {
        self.records_errored_total.load(Ordering::Relaxed)
    }

    /// Discarded records.
    pub fn records_discarded_total(&self) -> u64 {
        self.records_discarded_total.load(Ordering::Relaxed)
    }

    /// Committed records for one table.
    pub fn table_written(&self, table: &str) -> u64 {
        self.table_written
            .get(table)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Errored records for one table.
    pub fn table_errored(&self, table: &str) -> u64 {
        self.table_errored
            .get(table)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus_text(&self, cache: &CacheStatsSnapshot) -> String {
        let mut output = String::with_capacity(2048);

        // === BATCHES ===
        counter(
            &mut output,
            "tabsink_batches_total",
            "Batches handed to the sink",
            self.batches_total(),
        );
        counter(
            &mut output,
            "tabsink_empty_batches_total",
            "Empty batches",
            self.empty_batches_total(),
        );
        counter(
            &mut output,
            "tabsink_fatal_batches_total",
            "Batches rolled back on a fatal error",
            self.fatal_batches_total(),
        );

        // === RECORDS ===
        counter(
            &mut output,
            "tabsink_records_written_total",
            "Records committed",
            self.records_written_total(),
        );
        counter(
            &mut output,
            "tabsink_records_errored_total",
            "Records routed to the error handler",
            self.records_errored_total(),
        );
        counter(
            &mut output,
            "tabsink_records_discarded_total",
            "Records dropped by the unsupported-operation policy",
            self.records_discarded_total(),
        );
        labeled(
            &mut output,
            "tabsink_table_records_written",
            "Records committed per table",
            &self.table_written,
        );
        labeled(
            &mut output,
            "tabsink_table_records_errored",
            "Records routed to the error handler per table",
            &self.table_errored,
        );

        // === WRITER CACHE ===
        counter(
            &mut output,
            "tabsink_writer_cache_hits_total",
            "Writer cache hits",
            cache.hits,
        );
        counter(
            &mut output,
            "tabsink_writer_cache_misses_total",
            "Writer cache misses",
            cache.misses,
        );
        counter(
            &mut output,
            "tabsink_writer_constructions_total",
            "Writers constructed",
            cache.constructions,
        );
        counter(
            &mut output,
            "tabsink_writer_construction_failures_total",
            "Writer constructions that failed",
            cache.construction_failures,
        );
        counter(
            &mut output,
            "tabsink_writer_evictions_total",
            "Writers evicted to stay within capacity",
            cache.evictions,
        );
        counter(
            &mut output,
            "tabsink_writer_expirations_total",
            "Writers released after their TTL",
            cache.expirations,
        );
        counter(
            &mut output,
            "tabsink_writer_cache_sweeps_total",
            "Writer cache maintenance sweeps",
            cache.sweeps,
        );

        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    let _ = writeln!(output, "{} {}", name, value);
    output.push('\n');
}

fn labeled(output: &mut String, name: &str, help: &str, values: &DashMap<String, AtomicU64>) {
    let mut rows: Vec<(String, u64)> = values
        .iter()
        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
        .collect();
    rows.sort();

    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    for (table, value) in rows {
        let _ = writeln!(
            output,
            "{}{{table=\"{}\"}} {}",
            name,
            table.replace('\\', "\\\\").replace('"', "\\\""),
            value
        );
    }
    output.push('\n');
}
