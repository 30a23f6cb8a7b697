//! Tabsink Core - batch writer for dynamically named relational tables
//!
//! This library routes each record of a batch to a table whose name is
//! computed from the record itself, and writes every batch in a single
//! transaction with:
//!
//! - One lazily built writer per table, kept in a bounded, expiring cache
//! - Single-flight writer construction under concurrent access
//! - Per-record error routing or whole-batch rollback
//! - Exactly-once release of writers and the data source at shutdown

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod operation;
pub mod record;
pub mod sink;
pub mod store;
pub mod template;

// Re-export commonly used types
pub use cache::{CacheCleaner, RecordWriterCache, WriterCacheConfig};
pub use config::Config;
pub use coordinator::{BatchWriteCoordinator, WriteOutcome};
pub use error::{EvaluationError, StoreError, WriteError, WriterConstructionError};
pub use error::{Error, Result};
pub use handler::{DefaultErrorRecordHandler, ErrorRecordHandler, OnRecordError};
pub use record::Record;
pub use sink::{CloseReport, TableSink};
pub use template::{TableNameResolver, TemplateResolver};
