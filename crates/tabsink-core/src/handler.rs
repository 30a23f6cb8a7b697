//! Error-record routing.
//!
//! Per-record failures never abort a batch on their own. They are handed to an
//! [`ErrorRecordHandler`], which either drops them, keeps them for later
//! inspection, or asks the coordinator to stop the pipeline.

use crate::error::{EvaluationError, StoreError, WriteError, WriterConstructionError};
use crate::record::Record;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, warn};

/// Policy applied to records that fail.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnRecordError {
    /// Drop the record
    Discard,
    /// Keep the record as an error record (default)
    #[default]
    ToError,
    /// Fail the batch
    StopPipeline,
}

/// Why a record was routed to the error handler.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordErrorCause {
    /// The table name could not be resolved
    Evaluation(EvaluationError),
    /// The writer for the record's table could not be built
    WriterConstruction(WriterConstructionError),
    /// The store rejected the record
    Store {
        /// Target table
        table: String,
        /// Store failure
        error: StoreError,
    },
}

impl RecordErrorCause {
    /// Stable error code for reporting.
    pub fn code(&self) -> &'static str {
        match self {
            RecordErrorCause::Evaluation(_) => "TABSINK_01",
            RecordErrorCause::WriterConstruction(_) => "TABSINK_02",
            RecordErrorCause::Store {
                error: StoreError::UnsupportedOperation(_),
                ..
            } => "TABSINK_04",
            RecordErrorCause::Store { .. } => "TABSINK_03",
        }
    }

    /// The table the record was headed for, if it was resolved.
    pub fn table(&self) -> Option<&str> {
        match self {
            RecordErrorCause::Evaluation(_) => None,
            RecordErrorCause::WriterConstruction(err) => Some(&err.table),
            RecordErrorCause::Store { table, .. } => Some(table),
        }
    }

    /// Human readable description.
    pub fn message(&self) -> String {
        match self {
            RecordErrorCause::Evaluation(err) => err.to_string(),
            RecordErrorCause::WriterConstruction(err) => err.to_string(),
            RecordErrorCause::Store { error, .. } => error.to_string(),
        }
    }
}

/// A record that failed, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The failed record
    pub record: Record,
    /// Error code
    pub error_code: String,
    /// Error message
    pub error_message: String,
    /// Target table, when known
    pub table: Option<String>,
    /// When the failure was routed
    pub timestamp: DateTime<Utc>,
}

/// Sink for non-fatal per-record failures.
pub trait ErrorRecordHandler: Send + Sync {
    /// Route one failed record.
    ///
    /// Returning an error turns the failure into a fatal batch error.
    fn route(&self, record: &Record, cause: &RecordErrorCause) -> Result<(), WriteError>;
}

/// Error handler that applies an [`OnRecordError`] policy and keeps routed
/// records in memory.
#[derive(Debug, Default)]
pub struct DefaultErrorRecordHandler {
    policy: OnRecordError,
    records: Mutex<Vec<ErrorRecord>>,
}

impl DefaultErrorRecordHandler {
    /// Create a handler with the given policy.
    pub fn new(policy: OnRecordError) -> Self {
        Self {
            policy,
            records: Mutex::new(Vec::new()),
        }
    }

    /// The configured policy.
    pub fn policy(&self) -> OnRecordError {
        self.policy
    }

    /// Number of error records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no error records are held.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Take every held error record.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Drain held error records as newline-delimited JSON.
    ///
    /// Returns the number of records written.
    pub fn write_ndjson<W: Write>(&self, mut out: W) -> crate::Result<usize> {
        let records = self.drain();
        for record in &records {
            serde_json::to_writer(&mut out, record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(records.len())
    }
}

impl ErrorRecordHandler for DefaultErrorRecordHandler {
    fn route(&self, record: &Record, cause: &RecordErrorCause) -> Result<(), WriteError> {
        match self.policy {
            OnRecordError::Discard => {
                debug!(record_id = %record.id, code = cause.code(), "Discarding failed record");
                Ok(())
            }
            OnRecordError::ToError => {
                warn!(
                    record_id = %record.id,
                    table = cause.table().unwrap_or(""),
                    code = cause.code(),
                    error = %cause.message(),
                    "Routing record to error records"
                );
                self.records.lock().push(ErrorRecord {
                    record: record.clone(),
                    error_code: cause.code().to_string(),
                    error_message: cause.message(),
                    table: cause.table().map(str::to_string),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            OnRecordError::StopPipeline => Err(WriteError::StopPipeline {
                record_id: record.id.clone(),
                message: cause.message(),
            }),
        }
    }
}
