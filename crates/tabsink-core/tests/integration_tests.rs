//! Integration tests for tabsink-core.
//!
//! The `support` module provides an in-memory store that counts connections,
//! commits and releases so the lifecycle guarantees can be asserted directly.
//! The `jsonl_sink` module drives the file-backed store end to end.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tabsink_core::cache::{ManualClock, WriterCacheConfig};
use tabsink_core::config::{ConnectionConfig, FieldMapping, SinkConfig};
use tabsink_core::handler::{DefaultErrorRecordHandler, ErrorRecordHandler, OnRecordError};
use tabsink_core::store::WriterSpec;
use tabsink_core::{Config, Record, RecordWriterCache, TableSink};

mod support {
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tabsink_core::config::ConnectionConfig;
    use tabsink_core::error::{ConfigIssue, StoreError, WriterConstructionError};
    use tabsink_core::store::{
        Connection, DataSource, DataSourceProvider, RecordFailure, RecordWriter, Savepoint,
        WriteReport, WriterFactory, WriterSpec,
    };
    use tabsink_core::Record;

    /// Shared counters for one in-memory store.
    #[derive(Default)]
    pub struct Counters {
        pub connections: AtomicUsize,
        pub commits: AtomicUsize,
        pub rollbacks: AtomicUsize,
        pub source_closes: AtomicUsize,
        pub constructions: AtomicUsize,
        pub writer_closes: AtomicUsize,
        /// Writes or commits observed after their resource was released
        pub violations: AtomicUsize,
        pub source_closed: AtomicBool,
        pub committed: Mutex<HashMap<String, usize>>,
    }

    impl Counters {
        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }

        pub fn committed(&self, table: &str) -> usize {
            self.committed.lock().get(table).copied().unwrap_or(0)
        }
    }

    pub struct MemConnection {
        counters: Arc<Counters>,
        /// Table of every uncommitted row, in write order
        pending: Vec<String>,
    }

    impl Connection for MemConnection {
        fn commit(&mut self) -> Result<(), StoreError> {
            if self.counters.source_closed.load(Ordering::SeqCst) {
                self.counters.violations.fetch_add(1, Ordering::SeqCst);
            }
            let mut committed = self.counters.committed.lock();
            for table in self.pending.drain(..) {
                *committed.entry(table).or_default() += 1;
            }
            self.counters.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), StoreError> {
            self.pending.clear();
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn savepoint(&mut self) -> Result<Savepoint, StoreError> {
            Ok(Savepoint(self.pending.len() as u64))
        }

        fn rollback_to(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
            self.pending.truncate(savepoint.0 as usize);
            Ok(())
        }
    }

    pub struct MemSource {
        counters: Arc<Counters>,
    }

    impl DataSource for MemSource {
        type Connection = MemConnection;

        fn connection(&self) -> Result<MemConnection, StoreError> {
            self.counters.connections.fetch_add(1, Ordering::SeqCst);
            Ok(MemConnection {
                counters: Arc::clone(&self.counters),
                pending: Vec::new(),
            })
        }

        fn close(&self) -> Result<(), StoreError> {
            self.counters.source_closed.store(true, Ordering::SeqCst);
            self.counters.source_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct MemProvider {
        pub counters: Arc<Counters>,
    }

    impl DataSourceProvider for MemProvider {
        type Source = MemSource;

        fn create_data_source(&self, _config: &ConnectionConfig) -> Result<MemSource, ConfigIssue> {
            Ok(MemSource {
                counters: Arc::clone(&self.counters),
            })
        }
    }

    pub struct MemWriter {
        table: String,
        counters: Arc<Counters>,
        closed: bool,
    }

    impl RecordWriter for MemWriter {
        type Connection = MemConnection;

        fn table(&self) -> &str {
            &self.table
        }

        fn write(
            &mut self,
            conn: &mut MemConnection,
            records: &[&Record],
        ) -> Result<WriteReport, StoreError> {
            if self.closed {
                self.counters.violations.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::WriterClosed(self.table.clone()));
            }
            let mut report = WriteReport::default();
            for (index, record) in records.iter().enumerate() {
                if record.get("fail").is_some() {
                    report.failures.push(RecordFailure {
                        index,
                        error: StoreError::Constraint("rejected".into()),
                    });
                    continue;
                }
                conn.pending.push(self.table.clone());
                report.written += 1;
            }
            Ok(report)
        }

        fn close(&mut self) -> Result<(), StoreError> {
            self.closed = true;
            self.counters.writer_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct MemFactory {
        pub counters: Arc<Counters>,
        pub delay: Duration,
    }

    impl MemFactory {
        pub fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                delay: Duration::ZERO,
            }
        }
    }

    impl WriterFactory for MemFactory {
        type Writer = MemWriter;

        fn create(
            &self,
            table: &str,
            _spec: &WriterSpec,
        ) -> Result<MemWriter, WriterConstructionError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.counters.constructions.fetch_add(1, Ordering::SeqCst);
            Ok(MemWriter {
                table: table.to_string(),
                counters: Arc::clone(&self.counters),
                closed: false,
            })
        }
    }
}

use support::{Counters, MemFactory, MemProvider, MemSource};

fn spec() -> WriterSpec {
    WriterSpec::from_config(&SinkConfig::new("${table}"))
}

fn mem_cache(counters: &Arc<Counters>, clock: &Arc<ManualClock>) -> RecordWriterCache<MemFactory> {
    RecordWriterCache::with_config(
        MemFactory::new(Arc::clone(counters)),
        spec(),
        WriterCacheConfig::default(),
        clock.clone(),
    )
}

fn mem_sink(
    rollback_on_error: bool,
    handler: Arc<dyn ErrorRecordHandler>,
) -> (TableSink<MemSource, MemFactory>, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let mut sink_config = SinkConfig::new("${table}");
    sink_config.rollback_on_error = rollback_on_error;
    let config = Config::new(sink_config, ConnectionConfig::new("mem://"));

    let sink = TableSink::open(
        &config,
        &MemProvider {
            counters: Arc::clone(&counters),
        },
        MemFactory::new(Arc::clone(&counters)),
        handler,
    )
    .expect("sink opens");
    (sink, counters)
}

fn to_table(id: usize, table: &str) -> Record {
    Record::new(id.to_string(), json!({"table": table, "n": id}))
}

mod writer_cache {
    use super::*;

    #[test]
    fn test_distinct_keys_get_distinct_stable_writers() {
        let counters = Arc::new(Counters::default());
        let clock = Arc::new(ManualClock::new());
        let cache = mem_cache(&counters, &clock);

        let a = cache.get("a").unwrap();
        let b = cache.get("b").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(cache.get("a").unwrap().id(), a.id());
        assert_eq!(cache.get("b").unwrap().id(), b.id());
        assert_eq!(Counters::get(&counters.constructions), 2);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let counters = Arc::new(Counters::default());
        let clock = Arc::new(ManualClock::new());
        let cache = mem_cache(&counters, &clock);

        for i in 0..500 {
            cache.get(&format!("t{}", i)).unwrap();
        }
        assert_eq!(cache.len(), 500);

        // Touch t0 so t1 becomes the least recently used entry.
        cache.get("t0").unwrap();
        cache.get("t500").unwrap();

        assert_eq!(cache.len(), 500);
        assert!(cache.contains("t0"));
        assert!(!cache.contains("t1"));
        assert!(cache.contains("t500"));
        assert_eq!(Counters::get(&counters.writer_closes), 1);
        assert_eq!(cache.stats().snapshot().evictions, 1);
    }

    #[test]
    fn test_idle_writer_expires_after_ttl() {
        let counters = Arc::new(Counters::default());
        let clock = Arc::new(ManualClock::new());
        let cache = mem_cache(&counters, &clock);

        let first = cache.get("a").unwrap();
        clock.advance(Duration::from_secs(59 * 60));
        assert_eq!(cache.get("a").unwrap().id(), first.id());

        // Access refreshed the entry; a full hour of idleness expires it.
        clock.advance(Duration::from_secs(60 * 60));
        let second = cache.get("a").unwrap();

        assert_ne!(second.id(), first.id());
        assert!(first.is_closed());
        assert_eq!(Counters::get(&counters.constructions), 2);
        assert_eq!(Counters::get(&counters.writer_closes), 1);
    }

    #[test]
    fn test_concurrent_gets_construct_once() {
        let counters = Arc::new(Counters::default());
        let mut factory = MemFactory::new(Arc::clone(&counters));
        factory.delay = Duration::from_millis(50);
        let cache = Arc::new(RecordWriterCache::new(factory, spec()));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get("shared").unwrap().id()
                })
            })
            .collect();
        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(Counters::get(&counters.constructions), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn test_maintain_sweeps_once_per_interval() {
        let (sink, _counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        let cleaner = sink.coordinator().cleaner();

        // The sink runs on the system clock; the first sweep is an interval away.
        assert_eq!(cleaner.maintain(), None);
        assert_eq!(cleaner.maintain(), None);
        assert_eq!(cleaner.sweeps(), 0);

        let counters = Arc::new(Counters::default());
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(mem_cache(&counters, &clock));
        let cleaner = tabsink_core::CacheCleaner::new(Arc::clone(&cache));
        clock.advance(Duration::from_secs(10 * 60));

        assert_eq!(cleaner.maintain(), Some(0));
        assert_eq!(cleaner.maintain(), None);
        assert_eq!(cleaner.sweeps(), 1);
        assert_eq!(cleaner.attempts(), 2);
    }
}

mod batches {
    use super::*;
    use tabsink_core::{Error, WriteError};

    #[test]
    fn test_empty_batch_only_maintains() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        let opened_with = Counters::get(&counters.connections);

        let outcome = sink.write_batch(&[]).unwrap();

        assert_eq!(outcome.records_written, 0);
        assert!(outcome.tables.is_empty());
        assert_eq!(Counters::get(&counters.connections), opened_with);
        assert_eq!(Counters::get(&counters.commits), 0);
        assert_eq!(Counters::get(&counters.constructions), 0);
        assert_eq!(sink.coordinator().cleaner().attempts(), 1);
        assert_eq!(sink.metrics().empty_batches_total(), 1);
    }

    #[test]
    fn test_records_grouped_by_table() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        let batch = vec![to_table(1, "a"), to_table(2, "a"), to_table(3, "b")];

        let outcome = sink.write_batch(&batch).unwrap();

        assert_eq!(Counters::get(&counters.constructions), 2);
        assert_eq!(Counters::get(&counters.commits), 1);
        assert_eq!(counters.committed("a"), 2);
        assert_eq!(counters.committed("b"), 1);
        assert_eq!(outcome.table("a").map(|t| t.written), Some(2));
        assert_eq!(outcome.table("b").map(|t| t.written), Some(1));
        let order: Vec<&str> = outcome.tables.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_writers_reused_across_batches() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));

        sink.write_batch(&[to_table(1, "a")]).unwrap();
        sink.write_batch(&[to_table(2, "a"), to_table(3, "b")])
            .unwrap();

        assert_eq!(Counters::get(&counters.constructions), 2);
        assert_eq!(Counters::get(&counters.commits), 2);
        assert_eq!(counters.committed("a"), 2);
    }

    #[test]
    fn test_rollback_on_error_fails_whole_batch() {
        let handler = Arc::new(DefaultErrorRecordHandler::new(OnRecordError::ToError));
        let (sink, counters) = mem_sink(true, handler.clone());
        let mut batch: Vec<Record> = (1..=5).map(|i| to_table(i, "a")).collect();
        batch[2] = Record::new("3", json!({"table": "a", "fail": true}));

        let err = sink.write_batch(&batch).unwrap_err();

        assert!(matches!(err, Error::Write(WriteError::Store { .. })));
        assert!(err.is_fatal_batch_error());
        assert_eq!(Counters::get(&counters.commits), 0);
        assert_eq!(Counters::get(&counters.rollbacks), 1);
        assert_eq!(counters.committed("a"), 0);
        assert!(handler.is_empty());
    }

    #[test]
    fn test_failed_record_routed_without_rollback() {
        let handler = Arc::new(DefaultErrorRecordHandler::new(OnRecordError::ToError));
        let (sink, counters) = mem_sink(false, handler.clone());
        let mut batch: Vec<Record> = (1..=5).map(|i| to_table(i, "a")).collect();
        batch[2] = Record::new("3", json!({"table": "a", "fail": true}));

        let outcome = sink.write_batch(&batch).unwrap();

        assert_eq!(outcome.records_written, 4);
        assert_eq!(outcome.records_errored, 1);
        assert_eq!(counters.committed("a"), 4);
        let errors = handler.drain();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record.id, "3");
        assert_eq!(errors[0].error_code, "TABSINK_03");
    }

    #[test]
    fn test_unresolvable_table_is_routed() {
        let handler = Arc::new(DefaultErrorRecordHandler::new(OnRecordError::ToError));
        let (sink, counters) = mem_sink(true, handler.clone());
        let batch = vec![to_table(1, "a"), Record::new("2", json!({"other": 1}))];

        let outcome = sink.write_batch(&batch).unwrap();

        assert_eq!(outcome.records_written, 1);
        assert_eq!(outcome.records_errored, 1);
        assert_eq!(counters.committed("a"), 1);
        assert_eq!(handler.drain()[0].error_code, "TABSINK_01");
    }

    #[test]
    fn test_stop_pipeline_rolls_back() {
        let handler = Arc::new(DefaultErrorRecordHandler::new(OnRecordError::StopPipeline));
        let (sink, counters) = mem_sink(false, handler);
        let batch = vec![
            to_table(1, "a"),
            Record::new("2", json!({"table": "b", "fail": true})),
        ];

        let err = sink.write_batch(&batch).unwrap_err();

        assert!(matches!(err, Error::Write(WriteError::StopPipeline { .. })));
        assert_eq!(Counters::get(&counters.rollbacks), 1);
        assert_eq!(counters.committed("a"), 0);
    }
}

mod lifecycle {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tabsink_core::Error;

    #[test]
    fn test_close_releases_everything_once() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        let batch: Vec<Record> = (0..10).map(|i| to_table(i, &format!("t{}", i))).collect();
        sink.write_batch(&batch).unwrap();
        assert_eq!(sink.cache().len(), 10);

        let report = sink.close();
        assert_eq!(report.writers_released, 10);
        assert!(report.errors.is_empty());
        assert_eq!(Counters::get(&counters.writer_closes), 10);
        assert_eq!(Counters::get(&counters.source_closes), 1);

        assert!(sink.close().already_closed);
        drop(sink);
        assert_eq!(Counters::get(&counters.writer_closes), 10);
        assert_eq!(Counters::get(&counters.source_closes), 1);
    }

    #[test]
    fn test_drop_closes_sink() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        sink.write_batch(&[to_table(1, "a")]).unwrap();

        drop(sink);

        assert_eq!(Counters::get(&counters.writer_closes), 1);
        assert_eq!(Counters::get(&counters.source_closes), 1);
    }

    #[test]
    fn test_close_waits_for_in_flight_batches() {
        let (sink, counters) = mem_sink(false, Arc::new(DefaultErrorRecordHandler::default()));
        let sink = Arc::new(sink);
        let stop = Arc::new(AtomicBool::new(false));
        let committed = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let sink = Arc::clone(&sink);
                let stop = Arc::clone(&stop);
                let committed = Arc::clone(&committed);
                std::thread::spawn(move || {
                    let mut i = 0;
                    while !stop.load(Ordering::SeqCst) {
                        let batch = vec![to_table(i, &format!("w{}_{}", w, i % 7))];
                        match sink.write_batch(&batch) {
                            Ok(_) => {
                                committed.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(Error::Closed) => break,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                        i += 1;
                    }
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(30));
        let report = sink.close();
        stop.store(true, Ordering::SeqCst);
        for handle in writers {
            handle.join().unwrap();
        }

        assert!(!report.already_closed);
        assert_eq!(Counters::get(&counters.violations), 0);
        assert_eq!(Counters::get(&counters.source_closes), 1);
        assert_eq!(
            Counters::get(&counters.writer_closes),
            Counters::get(&counters.constructions)
        );
        assert_eq!(Counters::get(&counters.commits), committed.load(Ordering::SeqCst));
    }
}

mod jsonl_sink {
    use super::*;
    use tabsink_core::store::jsonl::{
        JsonlDataSource, JsonlDataSourceProvider, JsonlWriterFactory, TableLine,
    };
    use tabsink_core::{Error, WriteError};
    use tempfile::TempDir;

    fn open(
        dir: &TempDir,
        sink_config: SinkConfig,
        handler: Arc<dyn ErrorRecordHandler>,
    ) -> TableSink<JsonlDataSource, JsonlWriterFactory> {
        let config = Config::new(
            sink_config,
            ConnectionConfig::new(format!("jsonl://{}", dir.path().display())),
        );
        TableSink::open(&config, &JsonlDataSourceProvider, JsonlWriterFactory, handler)
            .expect("sink opens")
    }

    fn lines(path: &std::path::Path) -> Vec<TableLine> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn orders_config(rollback_on_error: bool) -> SinkConfig {
        let mut config = SinkConfig::new("orders_${region}");
        config.schema = "sales".into();
        config.rollback_on_error = rollback_on_error;
        config.field_mappings = vec![
            FieldMapping::new("id", "id"),
            FieldMapping::new("/amount/value", "total"),
        ];
        config
    }

    fn order(id: u64, region: &str) -> Record {
        Record::new(
            id.to_string(),
            json!({"id": id, "region": region, "amount": {"value": id * 10}}),
        )
    }

    #[test]
    fn test_end_to_end_routing() {
        let dir = TempDir::new().unwrap();
        let sink = open(&dir, orders_config(true), Arc::new(DefaultErrorRecordHandler::default()));

        let batch = vec![order(1, "eu"), order(2, "us"), order(3, "eu")];
        let outcome = sink.write_batch(&batch).unwrap();
        assert_eq!(outcome.records_written, 3);

        let eu = lines(&dir.path().join("sales").join("orders_eu.jsonl"));
        assert_eq!(eu.len(), 2);
        assert_eq!(eu[0].table, "orders_eu");
        assert_eq!(eu[0].columns, vec!["id", "total"]);
        assert_eq!(eu[0].rows, vec![vec![json!(1), json!(10)]]);
        assert_eq!(eu[1].rows, vec![vec![json!(3), json!(30)]]);

        let us = lines(&dir.path().join("sales").join("orders_us.jsonl"));
        assert_eq!(us.len(), 1);

        let report = sink.close();
        assert_eq!(report.writers_released, 2);
    }

    #[test]
    fn test_rollback_leaves_no_rows() {
        let dir = TempDir::new().unwrap();
        let sink = open(&dir, orders_config(true), Arc::new(DefaultErrorRecordHandler::default()));
        let mut batch: Vec<Record> = (1..=5).map(|i| order(i, "eu")).collect();
        batch[2] = Record::new("3", json!({"region": "eu", "amount": {"value": 1}}));

        let err = sink.write_batch(&batch).unwrap_err();

        assert!(matches!(err, Error::Write(WriteError::Store { .. })));
        assert!(lines(&dir.path().join("sales").join("orders_eu.jsonl")).is_empty());
    }

    #[test]
    fn test_without_rollback_good_rows_commit() {
        let dir = TempDir::new().unwrap();
        let handler = Arc::new(DefaultErrorRecordHandler::new(OnRecordError::ToError));
        let sink = open(&dir, orders_config(false), handler.clone());
        let mut batch: Vec<Record> = (1..=5).map(|i| order(i, "eu")).collect();
        batch[2] = Record::new("3", json!({"region": "eu", "amount": {"value": 1}}));

        let outcome = sink.write_batch(&batch).unwrap();

        assert_eq!(outcome.records_written, 4);
        assert_eq!(outcome.records_errored, 1);
        assert_eq!(lines(&dir.path().join("sales").join("orders_eu.jsonl")).len(), 4);
        let errors = handler.drain();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].table.as_deref(), Some("orders_eu"));
    }

    #[test]
    fn test_multi_row_statements() {
        let dir = TempDir::new().unwrap();
        let mut config = orders_config(true);
        config.use_multi_row_op = true;
        config.max_prepared_statement_parameters = Some(4);
        let sink = open(&dir, config, Arc::new(DefaultErrorRecordHandler::default()));

        let batch: Vec<Record> = (1..=5).map(|i| order(i, "eu")).collect();
        sink.write_batch(&batch).unwrap();

        // Two columns and four parameters allow two rows per statement.
        let eu = lines(&dir.path().join("sales").join("orders_eu.jsonl"));
        let rows: Vec<usize> = eu.iter().map(|l| l.rows.len()).collect();
        assert_eq!(rows, vec![2, 2, 1]);
    }
}
