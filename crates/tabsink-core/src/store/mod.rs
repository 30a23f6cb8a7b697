//! Store contracts.
//!
//! The sink never talks to a database directly. It obtains a connection per
//! batch from a [`DataSource`] and hands each table group to a
//! [`RecordWriter`] built by a [`WriterFactory`]. The JSON-lines store in
//! [`jsonl`] implements these contracts on top of plain files.

pub mod jsonl;

use crate::config::{ConnectionConfig, FieldMapping, SinkConfig};
use crate::error::{ConfigIssue, StoreError, WriterConstructionError};
use crate::operation::{ChangeLogFormat, OperationType, UnsupportedOperationAction};
use crate::record::Record;

/// A transactional connection used for one batch.
pub trait Connection: Send {
    /// Make every write issued on this connection durable.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every write issued since the last commit.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Mark the current point of the open transaction.
    fn savepoint(&mut self) -> Result<Savepoint, StoreError>;

    /// Discard the writes issued after `savepoint`, keeping earlier ones.
    fn rollback_to(&mut self, savepoint: Savepoint) -> Result<(), StoreError>;
}

/// A point inside a connection's open transaction.
///
/// The value is opaque to the sink; each connection decides what it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(pub u64);

/// Source of batch connections, typically a pool.
pub trait DataSource: Send + Sync {
    /// Connection type handed out by this source.
    type Connection: Connection;

    /// Obtain a connection for one batch.
    fn connection(&self) -> Result<Self::Connection, StoreError>;

    /// Release the source. Called once at teardown.
    fn close(&self) -> Result<(), StoreError>;
}

/// Builds a [`DataSource`] from connection configuration.
pub trait DataSourceProvider {
    /// Data source type this provider creates.
    type Source: DataSource;

    /// Create the data source.
    ///
    /// # Arguments
    /// * `config` - Connection settings from the `[connection]` section
    ///
    /// # Returns
    /// The data source, or the configuration issue that prevented creating it.
    fn create_data_source(&self, config: &ConnectionConfig) -> Result<Self::Source, ConfigIssue>;
}

/// A writer bound to one table.
///
/// Writers are expensive to build (statement caches, column metadata) and are
/// kept in the writer cache between batches.
pub trait RecordWriter: Send {
    /// Connection type this writer writes through.
    type Connection: Connection;

    /// The table this writer is bound to.
    fn table(&self) -> &str;

    /// Write a group of records bound for this table.
    ///
    /// Records the store rejects individually are reported in
    /// [`WriteReport::failures`]; an `Err` means the whole group failed. The
    /// caller rolls the connection back to a savepoint taken before the call,
    /// so rows issued before the failure never commit.
    fn write(
        &mut self,
        conn: &mut Self::Connection,
        records: &[&Record],
    ) -> Result<WriteReport, StoreError>;

    /// Release the writer's resources. Must be idempotent.
    fn close(&mut self) -> Result<(), StoreError>;
}

/// Constructs writers for resolved table names.
pub trait WriterFactory: Send + Sync {
    /// Writer type produced by this factory.
    type Writer: RecordWriter;

    /// Build a writer for `table`.
    fn create(
        &self,
        table: &str,
        spec: &WriterSpec,
    ) -> Result<Self::Writer, WriterConstructionError>;
}

/// Statement shape used by a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// One statement execution per record
    SingleRow,
    /// One statement per chunk of records
    MultiRow {
        /// Bound parameter limit per statement (None = unlimited)
        max_parameters: Option<usize>,
    },
}

impl WriteMode {
    /// Whether a statement already binding `bound` parameters may take one
    /// more row binding `row` parameters.
    ///
    /// An empty statement always takes the row, so a single row wider than
    /// the limit still gets written on its own.
    pub fn admits(&self, bound: usize, row: usize) -> bool {
        match self {
            WriteMode::SingleRow => bound == 0,
            WriteMode::MultiRow {
                max_parameters: None,
            } => true,
            WriteMode::MultiRow {
                max_parameters: Some(max),
            } => bound == 0 || bound + row <= *max,
        }
    }
}

/// Static configuration handed to the writer factory for every table.
#[derive(Debug, Clone)]
pub struct WriterSpec {
    /// Schema the table lives in
    pub schema: String,
    /// Field to column mappings
    pub mappings: Vec<FieldMapping>,
    /// Statement shape
    pub write_mode: WriteMode,
    /// Change-log format of incoming records
    pub change_log_format: ChangeLogFormat,
    /// Operation for records without one
    pub default_operation: OperationType,
    /// Handling of unsupported operation codes
    pub unsupported_action: UnsupportedOperationAction,
    /// Case-sensitive column names
    pub case_sensitive: bool,
    /// Prepared statement cache bound per writer (None = unlimited)
    pub max_statement_cache: Option<usize>,
}

impl WriterSpec {
    /// Derive the writer settings from the sink configuration.
    pub fn from_config(config: &SinkConfig) -> Self {
        let write_mode = if config.use_multi_row_op {
            WriteMode::MultiRow {
                max_parameters: config.max_prepared_statement_parameters,
            }
        } else {
            WriteMode::SingleRow
        };

        Self {
            schema: config.schema.clone(),
            mappings: config.field_mappings.clone(),
            write_mode,
            change_log_format: config.change_log_format,
            default_operation: config.default_operation,
            unsupported_action: config.unsupported_action,
            case_sensitive: config.case_sensitive,
            max_statement_cache: config.max_prepared_statement_cache,
        }
    }
}

/// A record the store rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    /// Position of the record in the group passed to [`RecordWriter::write`]
    pub index: usize,
    /// Cause
    pub error: StoreError,
}

/// Result of writing one table group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    /// Records written
    pub written: usize,
    /// Records dropped by the unsupported-operation policy
    pub discarded: usize,
    /// Records rejected individually
    pub failures: Vec<RecordFailure>,
}

impl WriteReport {
    /// Whether every record was written or deliberately dropped.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
