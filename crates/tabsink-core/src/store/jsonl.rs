//! JSON-lines table store.
//!
//! Each table is a file `<root>/<schema>/<table>.jsonl`. A connection buffers
//! the lines written during a batch and appends them on commit, so a rolled
//! back batch leaves no trace.
//!
//! Every line is one statement execution:
//!
//! ```json
//! {"op":"insert","schema":"sales","table":"orders","columns":["id","total"],"params":["?","?"],"rows":[[1,9.5]]}
//! ```
//!
//! `params` holds the parameter expression bound for each column, taken from
//! the column's field mapping. Single-row mode writes one row per line.
//! Multi-row mode packs as many rows per line as the bound-parameter limit
//! allows.

use crate::config::ConnectionConfig;
use crate::error::{ConfigIssue, StoreError, WriterConstructionError};
use crate::operation::{resolve_operation, OperationType};
use crate::record::Record;
use crate::store::{
    Connection, DataSource, DataSourceProvider, RecordFailure, RecordWriter, Savepoint,
    WriteMode, WriteReport, WriterFactory, WriterSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Connection string scheme accepted by [`JsonlDataSourceProvider`].
pub const SCHEME: &str = "jsonl://";

/// File extension of table files.
pub const TABLE_FILE_EXTENSION: &str = "jsonl";

/// One line of a table file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLine {
    /// Operation applied to every row in the line
    pub op: OperationType,
    /// Schema name (empty for the default schema)
    pub schema: String,
    /// Table name
    pub table: String,
    /// Column names, in parameter order
    pub columns: Vec<String>,
    /// Parameter expression per column
    #[serde(default)]
    pub params: Vec<String>,
    /// Parameter rows
    pub rows: Vec<Vec<Value>>,
}

/// Creates [`JsonlDataSource`]s from `jsonl://<dir>` or plain directory
/// connection strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlDataSourceProvider;

impl JsonlDataSourceProvider {
    fn root_dir(connection_string: &str) -> Result<PathBuf, ConfigIssue> {
        let raw = connection_string.trim();
        let path = raw.strip_prefix(SCHEME).unwrap_or(raw);
        if path.is_empty() {
            return Err(ConfigIssue::new(
                "connection",
                "connection_string",
                "Connection string does not name a directory",
            ));
        }
        if path.contains("://") {
            return Err(ConfigIssue::new(
                "connection",
                "connection_string",
                format!("Unsupported connection string '{}'", raw),
            ));
        }
        Ok(PathBuf::from(path))
    }
}

impl DataSourceProvider for JsonlDataSourceProvider {
    type Source = JsonlDataSource;

    fn create_data_source(&self, config: &ConnectionConfig) -> Result<JsonlDataSource, ConfigIssue> {
        let root = Self::root_dir(&config.connection_string)?;
        std::fs::create_dir_all(&root).map_err(|e| {
            ConfigIssue::new(
                "connection",
                "connection_string",
                format!("Cannot create directory '{}': {}", root.display(), e),
            )
        })?;

        info!(root = %root.display(), "JSON-lines data source ready");
        Ok(JsonlDataSource::new(root))
    }
}

/// Data source rooted at a directory.
#[derive(Debug)]
pub struct JsonlDataSource {
    root: PathBuf,
    closed: AtomicBool,
}

impl JsonlDataSource {
    /// Create a data source over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether [`DataSource::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Path of the file backing `schema.table`.
    pub fn table_path(&self, schema: &str, table: &str) -> PathBuf {
        self.root.join(table_file(schema, table))
    }
}

impl DataSource for JsonlDataSource {
    type Connection = JsonlConnection;

    fn connection(&self) -> Result<JsonlConnection, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Connection("Data source is closed".into()));
        }
        Ok(JsonlConnection::new(self.root.clone()))
    }

    fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(root = %self.root.display(), "JSON-lines data source closed");
        }
        Ok(())
    }
}

/// A batch connection. Lines stay in memory until [`Connection::commit`].
///
/// Pending lines are kept in issue order; a savepoint is the number of lines
/// pending when it was taken.
#[derive(Debug)]
pub struct JsonlConnection {
    root: PathBuf,
    pending: Vec<(PathBuf, String)>,
}

impl JsonlConnection {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            pending: Vec::new(),
        }
    }

    fn append(&mut self, relative: &Path, line: String) {
        self.pending.push((relative.to_path_buf(), line));
    }

    /// Number of lines waiting for commit.
    pub fn pending_lines(&self) -> usize {
        self.pending.len()
    }
}

impl Connection for JsonlConnection {
    fn commit(&mut self) -> Result<(), StoreError> {
        let commit_err = |path: &Path, e: std::io::Error| {
            StoreError::Commit(format!("{}: {}", path.display(), e))
        };

        let mut files: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for (relative, line) in std::mem::take(&mut self.pending) {
            files.entry(relative).or_default().push(line);
        }

        for (relative, lines) in files {
            let path = self.root.join(&relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| commit_err(&path, e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| commit_err(&path, e))?;

            let mut out = BufWriter::new(file);
            for line in &lines {
                out.write_all(line.as_bytes())
                    .and_then(|_| out.write_all(b"\n"))
                    .map_err(|e| commit_err(&path, e))?;
            }
            out.flush().map_err(|e| commit_err(&path, e))?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let discarded = self.pending_lines();
        self.pending.clear();
        if discarded > 0 {
            debug!(lines = discarded, "Discarded uncommitted lines");
        }
        Ok(())
    }

    fn savepoint(&mut self) -> Result<Savepoint, StoreError> {
        Ok(Savepoint(self.pending.len() as u64))
    }

    fn rollback_to(&mut self, savepoint: Savepoint) -> Result<(), StoreError> {
        let keep = usize::try_from(savepoint.0)
            .ok()
            .filter(|&keep| keep <= self.pending.len())
            .ok_or_else(|| StoreError::Rollback(format!("Unknown savepoint {}", savepoint.0)))?;
        let discarded = self.pending.len() - keep;
        self.pending.truncate(keep);
        if discarded > 0 {
            debug!(lines = discarded, "Discarded lines after savepoint");
        }
        Ok(())
    }
}

/// Builds [`JsonlTableWriter`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlWriterFactory;

impl WriterFactory for JsonlWriterFactory {
    type Writer = JsonlTableWriter;

    fn create(
        &self,
        table: &str,
        spec: &WriterSpec,
    ) -> Result<JsonlTableWriter, WriterConstructionError> {
        validate_identifier(table, false).map_err(|m| WriterConstructionError::new(table, m))?;
        validate_identifier(&spec.schema, true)
            .map_err(|m| WriterConstructionError::new(table, format!("schema {}", m)))?;

        debug!(table, schema = %spec.schema, mode = ?spec.write_mode, "Creating table writer");
        Ok(JsonlTableWriter::new(table, spec.clone()))
    }
}

fn validate_identifier(name: &str, allow_empty: bool) -> Result<(), String> {
    if name.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err("name is empty".into())
        };
    }
    if name == "." || name.contains("..") {
        return Err(format!("'{}' is not a valid name", name));
    }
    if name.chars().any(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(format!("'{}' contains a path separator", name));
    }
    Ok(())
}

fn table_file(schema: &str, table: &str) -> PathBuf {
    let file = format!("{}.{}", table, TABLE_FILE_EXTENSION);
    if schema.is_empty() {
        PathBuf::from(file)
    } else {
        Path::new(schema).join(file)
    }
}

fn column_name(spec: &WriterSpec, name: &str) -> String {
    if spec.case_sensitive {
        name.to_string()
    } else {
        name.to_lowercase()
    }
}

/// Parameter expression for each column; unmapped columns bind `?`.
fn param_values(spec: &WriterSpec, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|column| {
            spec.mappings
                .iter()
                .find(|m| column_name(spec, &m.column) == *column)
                .map_or_else(|| "?".to_string(), |m| m.param_value.clone())
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    op: OperationType,
    columns: Vec<String>,
}

/// A prepared statement: operation, column order and parameter expressions.
#[derive(Debug)]
struct PreparedStatement {
    op: OperationType,
    columns: Vec<String>,
    params: Vec<String>,
}

/// Bounded FIFO cache of prepared statements.
#[derive(Debug)]
struct StatementCache {
    capacity: Option<usize>,
    statements: HashMap<StatementKey, Arc<PreparedStatement>>,
    order: VecDeque<StatementKey>,
}

impl StatementCache {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            statements: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn prepare(
        &mut self,
        op: OperationType,
        columns: &[String],
        params: impl FnOnce() -> Vec<String>,
    ) -> Arc<PreparedStatement> {
        let key = StatementKey {
            op,
            columns: columns.to_vec(),
        };
        if let Some(statement) = self.statements.get(&key) {
            return Arc::clone(statement);
        }

        if let Some(capacity) = self.capacity {
            while self.order.len() >= capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.statements.remove(&oldest);
                    }
                    None => break,
                }
            }
        }

        let statement = Arc::new(PreparedStatement {
            op,
            columns: key.columns.clone(),
            params: params(),
        });
        self.order.push_back(key.clone());
        self.statements.insert(key, Arc::clone(&statement));
        statement
    }

    fn len(&self) -> usize {
        self.statements.len()
    }

    fn clear(&mut self) {
        self.statements.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone)]
struct Row {
    op: OperationType,
    columns: Vec<String>,
    values: Vec<Value>,
}

/// Writer for one JSON-lines table.
#[derive(Debug)]
pub struct JsonlTableWriter {
    table: String,
    file: PathBuf,
    spec: WriterSpec,
    statements: StatementCache,
    closed: bool,
}

impl JsonlTableWriter {
    fn new(table: &str, spec: WriterSpec) -> Self {
        Self {
            table: table.to_string(),
            file: table_file(&spec.schema, table),
            statements: StatementCache::new(spec.max_statement_cache),
            spec,
            closed: false,
        }
    }

    /// Number of prepared statements currently cached.
    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    /// Whether the writer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn column_name(&self, name: &str) -> String {
        column_name(&self.spec, name)
    }

    fn extract(&self, record: &Record) -> Result<Option<Row>, StoreError> {
        let Some(op) = resolve_operation(
            record,
            self.spec.default_operation,
            self.spec.unsupported_action,
        )?
        else {
            return Ok(None);
        };

        let row = self.spec.change_log_format.row_values(record).ok_or_else(|| {
            StoreError::Constraint(format!(
                "Record '{}' carries no row values for {:?} change log",
                record.id, self.spec.change_log_format
            ))
        })?;

        let (columns, values): (Vec<String>, Vec<Value>) = if self.spec.mappings.is_empty() {
            let object = row.as_object().ok_or_else(|| {
                StoreError::Constraint(format!("Record '{}' is not an object", record.id))
            })?;
            object
                .iter()
                .map(|(k, v)| (self.column_name(k), v.clone()))
                .unzip()
        } else {
            let mut columns = Vec::with_capacity(self.spec.mappings.len());
            let mut values = Vec::with_capacity(self.spec.mappings.len());
            for mapping in &self.spec.mappings {
                let value = if mapping.field.starts_with('/') {
                    row.pointer(&mapping.field)
                } else {
                    row.get(&mapping.field)
                };
                let value = value.ok_or_else(|| {
                    StoreError::Constraint(format!(
                        "Record '{}' has no field '{}' for column '{}'",
                        record.id, mapping.field, mapping.column
                    ))
                })?;
                columns.push(self.column_name(&mapping.column));
                values.push(value.clone());
            }
            (columns, values)
        };

        Ok(Some(Row {
            op,
            columns,
            values,
        }))
    }

    fn append_statement(
        &mut self,
        conn: &mut JsonlConnection,
        op: OperationType,
        columns: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), StoreError> {
        let spec = &self.spec;
        let statement = self
            .statements
            .prepare(op, columns, || param_values(spec, columns));
        let line = TableLine {
            op: statement.op,
            schema: self.spec.schema.clone(),
            table: self.table.clone(),
            columns: statement.columns.clone(),
            params: statement.params.clone(),
            rows,
        };
        let text =
            serde_json::to_string(&line).map_err(|e| StoreError::Statement(e.to_string()))?;
        conn.append(&self.file, text);
        Ok(())
    }

    fn write_single_rows(
        &mut self,
        conn: &mut JsonlConnection,
        rows: Vec<Result<Option<Row>, StoreError>>,
        report: &mut WriteReport,
    ) -> Result<(), StoreError> {
        for (index, row) in rows.into_iter().enumerate() {
            match row {
                Ok(None) => report.discarded += 1,
                Ok(Some(row)) => {
                    self.append_statement(conn, row.op, &row.columns, vec![row.values])?;
                    report.written += 1;
                }
                Err(error) => report.failures.push(RecordFailure { index, error }),
            }
        }
        Ok(())
    }

    fn write_multi_rows(
        &mut self,
        conn: &mut JsonlConnection,
        rows: Vec<Result<Option<Row>, StoreError>>,
        report: &mut WriteReport,
    ) -> Result<(), StoreError> {
        // A chunk never binds more parameters than the limit, whatever the
        // width of each row, so no statement cut from it does either.
        let mut chunk: Vec<usize> = Vec::new();
        let mut bound = 0;

        for (index, row) in rows.iter().enumerate() {
            let width = match row {
                Ok(None) => {
                    report.discarded += 1;
                    continue;
                }
                Ok(Some(row)) => row.values.len(),
                Err(_) => self.spec.mappings.len(),
            }
            .max(1);

            if !self.spec.write_mode.admits(bound, width) {
                self.flush_chunk(conn, &chunk, &rows, report)?;
                chunk.clear();
                bound = 0;
            }
            chunk.push(index);
            bound += width;
        }

        if !chunk.is_empty() {
            self.flush_chunk(conn, &chunk, &rows, report)?;
        }
        Ok(())
    }

    fn flush_chunk(
        &mut self,
        conn: &mut JsonlConnection,
        chunk: &[usize],
        rows: &[Result<Option<Row>, StoreError>],
        report: &mut WriteReport,
    ) -> Result<(), StoreError> {
        if let Some(failed) = chunk.iter().copied().find(|&i| rows[i].is_err()) {
            for &index in chunk {
                let error = match &rows[index] {
                    Err(error) => error.clone(),
                    Ok(_) => StoreError::Statement(format!(
                        "Multi-row statement rejected because record {} failed",
                        failed
                    )),
                };
                report.failures.push(RecordFailure { index, error });
            }
            return Ok(());
        }

        // One statement per (operation, column set) within the chunk.
        let mut statements: Vec<(OperationType, Vec<String>, Vec<Vec<Value>>)> = Vec::new();
        for &index in chunk {
            if let Ok(Some(row)) = &rows[index] {
                match statements
                    .iter_mut()
                    .find(|(op, columns, _)| *op == row.op && *columns == row.columns)
                {
                    Some((_, _, values)) => values.push(row.values.clone()),
                    None => statements.push((
                        row.op,
                        row.columns.clone(),
                        vec![row.values.clone()],
                    )),
                }
            }
        }

        for (op, columns, values) in statements {
            self.append_statement(conn, op, &columns, values)?;
        }
        report.written += chunk.len();
        Ok(())
    }
}

impl RecordWriter for JsonlTableWriter {
    type Connection = JsonlConnection;

    fn table(&self) -> &str {
        &self.table
    }

    fn write(
        &mut self,
        conn: &mut JsonlConnection,
        records: &[&Record],
    ) -> Result<WriteReport, StoreError> {
        if self.closed {
            return Err(StoreError::WriterClosed(self.table.clone()));
        }

        let rows: Vec<_> = records.iter().map(|r| self.extract(r)).collect();
        let mut report = WriteReport::default();

        match self.spec.write_mode {
            WriteMode::SingleRow => self.write_single_rows(conn, rows, &mut report)?,
            WriteMode::MultiRow { .. } => self.write_multi_rows(conn, rows, &mut report)?,
        }

        Ok(report)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if !self.closed {
            self.statements.clear();
            self.closed = true;
            debug!(table = %self.table, "Table writer closed");
        }
        Ok(())
    }
}
