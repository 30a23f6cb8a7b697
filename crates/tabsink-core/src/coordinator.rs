//! Batch dispatch.
//!
//! A batch is split into per-table groups, each group is written through the
//! cached writer for its table, and the whole batch is committed on one
//! connection. With rollback-on-error set, any store or construction failure
//! rolls the batch back and fails it; otherwise failures are routed record by
//! record to the error handler and the batch carries on.

use crate::cache::{CacheCleaner, RecordWriterCache};
use crate::error::{StoreError, WriteError, WriterConstructionError};
use crate::handler::{ErrorRecordHandler, RecordErrorCause};
use crate::metrics::SinkMetrics;
use crate::record::Record;
use crate::store::{Connection, DataSource, RecordWriter, WriteReport, WriterFactory};
use crate::template::TableNameResolver;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Per-table result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOutcome {
    /// Resolved table name
    pub table: String,
    /// Records committed
    pub written: usize,
    /// Records routed to the error handler
    pub errored: usize,
    /// Records dropped by the unsupported-operation policy
    pub discarded: usize,
}

/// Result of a committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Records committed
    pub records_written: usize,
    /// Records routed to the error handler
    pub records_errored: usize,
    /// Records dropped by the unsupported-operation policy
    pub records_discarded: usize,
    /// Per-table results, in the order tables first appeared in the batch
    pub tables: Vec<TableOutcome>,
}

impl WriteOutcome {
    /// Result for one table.
    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables.iter().find(|t| t.table == name)
    }

    fn add(&mut self, table: TableOutcome) {
        self.records_written += table.written;
        self.records_errored += table.errored;
        self.records_discarded += table.discarded;
        self.tables.push(table);
    }
}

type Group<'a> = (String, Vec<&'a Record>);

/// Drives batches through the writer cache.
pub struct BatchWriteCoordinator<D: DataSource, F: WriterFactory> {
    resolver: Arc<dyn TableNameResolver>,
    data_source: Arc<D>,
    cache: Arc<RecordWriterCache<F>>,
    cleaner: CacheCleaner<F>,
    error_handler: Arc<dyn ErrorRecordHandler>,
    rollback_on_error: bool,
    metrics: Arc<SinkMetrics>,
}

impl<D, F> BatchWriteCoordinator<D, F>
where
    D: DataSource,
    F: WriterFactory,
    F::Writer: RecordWriter<Connection = D::Connection>,
{
    /// Create a coordinator.
    pub fn new(
        resolver: Arc<dyn TableNameResolver>,
        data_source: Arc<D>,
        cache: Arc<RecordWriterCache<F>>,
        error_handler: Arc<dyn ErrorRecordHandler>,
        rollback_on_error: bool,
        metrics: Arc<SinkMetrics>,
    ) -> Self {
        let cleaner = CacheCleaner::new(Arc::clone(&cache));
        Self {
            resolver,
            data_source,
            cache,
            cleaner,
            error_handler,
            rollback_on_error,
            metrics,
        }
    }

    /// The writer cache.
    pub fn cache(&self) -> &Arc<RecordWriterCache<F>> {
        &self.cache
    }

    /// The cache cleaner.
    pub fn cleaner(&self) -> &CacheCleaner<F> {
        &self.cleaner
    }

    /// Write one batch.
    ///
    /// An empty batch performs no writes and gives the cache cleaner a chance
    /// to run. Otherwise the batch is committed once, after every table group
    /// has been written. A returned error means the batch was rolled back.
    pub fn write_batch(&self, batch: &[Record]) -> Result<WriteOutcome, WriteError> {
        if batch.is_empty() {
            self.metrics.record_empty_batch();
            self.cleaner.maintain();
            return Ok(WriteOutcome::default());
        }

        let mut outcome = WriteOutcome::default();
        let groups = self
            .group_by_table(batch, &mut outcome)
            .map_err(|e| self.failed(e))?;

        if !groups.is_empty() {
            let mut conn = self
                .data_source
                .connection()
                .map_err(|e| self.failed(WriteError::Connection(e)))?;

            let result = self
                .write_groups(&mut conn, groups, &mut outcome)
                .and_then(|()| conn.commit().map_err(WriteError::Commit));

            if let Err(err) = result {
                if let Err(rollback_err) = conn.rollback() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(self.failed(err));
            }
        }

        self.metrics.record_batch(
            outcome.records_written as u64,
            outcome.records_errored as u64,
            outcome.records_discarded as u64,
        );
        for table in &outcome.tables {
            self.metrics
                .record_table_written(&table.table, table.written as u64);
            self.metrics
                .record_table_errored(&table.table, table.errored as u64);
        }

        debug!(
            records = batch.len(),
            tables = outcome.tables.len(),
            written = outcome.records_written,
            errored = outcome.records_errored,
            "Batch committed"
        );
        Ok(outcome)
    }

    fn failed(&self, err: WriteError) -> WriteError {
        self.metrics.record_fatal_batch();
        error!(error = %err, "Batch failed");
        err
    }

    fn route(&self, record: &Record, cause: &RecordErrorCause) -> Result<(), WriteError> {
        self.error_handler.route(record, cause)
    }

    /// Resolve every record's table, keeping tables in first-seen order.
    fn group_by_table<'a>(
        &self,
        batch: &'a [Record],
        outcome: &mut WriteOutcome,
    ) -> Result<Vec<Group<'a>>, WriteError> {
        let mut groups: Vec<Group<'a>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in batch {
            match self.resolver.resolve(record) {
                Ok(table) => match index.get(&table) {
                    Some(&i) => groups[i].1.push(record),
                    None => {
                        index.insert(table.clone(), groups.len());
                        groups.push((table, vec![record]));
                    }
                },
                Err(err) => {
                    self.route(record, &RecordErrorCause::Evaluation(err))?;
                    outcome.records_errored += 1;
                }
            }
        }
        Ok(groups)
    }

    fn write_groups(
        &self,
        conn: &mut D::Connection,
        groups: Vec<Group<'_>>,
        outcome: &mut WriteOutcome,
    ) -> Result<(), WriteError> {
        for (table, records) in groups {
            let mark = conn.savepoint().map_err(WriteError::Connection)?;
            let result = match self.write_group(conn, &table, &records) {
                Ok(result) => result,
                Err(err) => {
                    if self.rollback_on_error {
                        return Err(WriteError::WriterConstruction(err));
                    }
                    let cause = RecordErrorCause::WriterConstruction(err);
                    for record in &records {
                        self.route(record, &cause)?;
                    }
                    outcome.add(TableOutcome {
                        table,
                        errored: records.len(),
                        ..Default::default()
                    });
                    continue;
                }
            };

            let table_outcome = match result {
                Ok(report) => self.apply_report(table, &records, report)?,
                Err(error) => {
                    if self.rollback_on_error {
                        return Err(WriteError::Store {
                            table,
                            source: error,
                        });
                    }
                    warn!(table = %table, error = %error, records = records.len(), "Table write failed");
                    // Rows issued before the failure must not commit with the batch
                    conn.rollback_to(mark).map_err(|source| WriteError::Store {
                        table: table.clone(),
                        source,
                    })?;
                    let cause = RecordErrorCause::Store {
                        table: table.clone(),
                        error,
                    };
                    for record in &records {
                        self.route(record, &cause)?;
                    }
                    TableOutcome {
                        table,
                        errored: records.len(),
                        ..Default::default()
                    }
                }
            };
            outcome.add(table_outcome);
        }
        Ok(())
    }

    /// Write one group through its cached writer.
    ///
    /// A writer evicted between lookup and use refuses the write; the group is
    /// retried once with a fresh writer from the cache.
    fn write_group(
        &self,
        conn: &mut D::Connection,
        table: &str,
        records: &[&Record],
    ) -> Result<Result<WriteReport, StoreError>, WriterConstructionError> {
        let mut retried = false;
        loop {
            let handle = self.cache.get(table)?;
            match handle.with_writer(|writer| writer.write(conn, records)) {
                Ok(result) => return Ok(result),
                Err(closed) if retried => return Ok(Err(closed)),
                Err(_) => {
                    debug!(table, "Writer released during batch, fetching a new one");
                    retried = true;
                }
            }
        }
    }

    fn apply_report(
        &self,
        table: String,
        records: &[&Record],
        mut report: WriteReport,
    ) -> Result<TableOutcome, WriteError> {
        if report.is_clean() {
            return Ok(TableOutcome {
                table,
                written: report.written,
                errored: 0,
                discarded: report.discarded,
            });
        }
        if self.rollback_on_error {
            if let Some(failure) = report.failures.drain(..).next() {
                return Err(WriteError::Store {
                    table,
                    source: failure.error,
                });
            }
        }

        let mut errored = 0;
        for failure in report.failures {
            let Some(record) = records.get(failure.index) else {
                warn!(table = %table, index = failure.index, "Writer reported an unknown record");
                continue;
            };
            let cause = RecordErrorCause::Store {
                table: table.clone(),
                error: failure.error,
            };
            self.route(record, &cause)?;
            errored += 1;
        }

        Ok(TableOutcome {
            table,
            written: report.written,
            errored,
            discarded: report.discarded,
        })
    }
}
