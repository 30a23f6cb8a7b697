//! Error types for the tabsink core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Per-record failures (`EvaluationError`, `StoreError` attributed to one
//! record) are routed to the error-record handler; `WriteError` is what a
//! batch raises when it has to be rolled back.

use std::fmt;
use thiserror::Error;

/// Result type alias for tabsink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for tabsink.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stage initialization found one or more configuration issues
    #[error("Invalid configuration: {}", format_issues(.issues))]
    InvalidConfig { issues: Vec<ConfigIssue> },

    /// Fatal batch failure, the batch transaction was rolled back
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The sink has been closed and no longer admits batches
    #[error("Sink is closed")]
    Closed,
}

impl Error {
    /// Whether this error aborted a batch (as opposed to a setup failure).
    pub fn is_fatal_batch_error(&self) -> bool {
        matches!(self, Error::Write(_))
    }
}

/// A structured configuration problem detected while opening the stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Config group, e.g. "sink" or "connection"
    pub group: String,
    /// Config key inside the group
    pub config: String,
    /// Human readable description
    pub message: String,
}

impl ConfigIssue {
    /// Create a new config issue.
    pub fn new(
        group: impl Into<String>,
        config: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            config: config.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.group, self.config, self.message)
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Table-name template evaluation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    /// Template syntax is invalid
    #[error("Invalid template '{template}': {message}")]
    InvalidTemplate { template: String, message: String },

    /// A referenced field is absent from the record
    #[error("Field '{field}' not found in record")]
    MissingField { field: String },

    /// A referenced header is absent from the record
    #[error("Header '{header}' not found in record")]
    MissingHeader { header: String },

    /// A referenced field is not a scalar value
    #[error("Field '{field}' is not a scalar value")]
    NotScalar { field: String },

    /// The template resolved to an empty table name
    #[error("Template '{template}' resolved to an empty table name")]
    EmptyTableName { template: String },
}

/// Failure constructing the writer for one table.
///
/// `Clone` so every caller waiting on the same in-flight construction
/// observes the same failure.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to create writer for table '{table}': {message}")]
pub struct WriterConstructionError {
    /// Resolved table name
    pub table: String,
    /// Cause
    pub message: String,
}

impl WriterConstructionError {
    /// Create a new construction error.
    pub fn new(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            message: message.into(),
        }
    }
}

/// Errors reported by the underlying store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Could not obtain or use a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Statement execution failed
    #[error("Statement failed: {0}")]
    Statement(String),

    /// Record violates the column mapping (missing required value etc.)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Operation is not supported for this record
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Commit failed
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Rollback failed
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// Writer has already been released
    #[error("Writer for table '{0}' is closed")]
    WriterClosed(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Statement(err.to_string())
    }
}

/// Fatal batch failures. The batch transaction is rolled back before any of
/// these is returned.
#[derive(Error, Debug)]
pub enum WriteError {
    /// Store failure while writing a table group with rollback-on-error set
    #[error("Write to table '{table}' failed: {source}")]
    Store {
        table: String,
        #[source]
        source: StoreError,
    },

    /// Writer construction failed with rollback-on-error set
    #[error(transparent)]
    WriterConstruction(WriterConstructionError),

    /// Transaction commit failed
    #[error("Commit failed: {0}")]
    Commit(StoreError),

    /// Could not open the batch connection
    #[error("Could not obtain connection: {0}")]
    Connection(StoreError),

    /// The error-record policy requested a pipeline stop
    #[error("Pipeline stopped on record '{record_id}': {message}")]
    StopPipeline { record_id: String, message: String },
}

/// Failures while releasing resources at teardown or eviction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// Closing a writer failed
    #[error("Failed to close writer for table '{table}': {message}")]
    WriterClose { table: String, message: String },

    /// Closing the data source failed
    #[error("Failed to close data source: {0}")]
    DataSourceClose(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("invalid value".into());
        assert_eq!(err.to_string(), "Configuration error: invalid value");

        let err: Error = WriteError::WriterConstruction(WriterConstructionError::new(
            "orders",
            "no such table",
        ))
        .into();
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("no such table"));
    }

    #[test]
    fn test_invalid_config_lists_issues() {
        let err = Error::InvalidConfig {
            issues: vec![
                ConfigIssue::new("sink", "table_name_template", "unclosed '${'"),
                ConfigIssue::new("connection", "connection_string", "required"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("sink.table_name_template: unclosed '${'"));
        assert!(text.contains("connection.connection_string: required"));
    }

    #[test]
    fn test_write_error_source() {
        let err = WriteError::Store {
            table: "a".into(),
            source: StoreError::Statement("duplicate key".into()),
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(Error::from(err).is_fatal_batch_error());
    }

    #[test]
    fn test_construction_error_is_clone() {
        let err = WriterConstructionError::new("t", "boom");
        assert_eq!(err.clone(), err);
    }
}
