//! Write operations and change-log handling.
//!
//! A record's operation comes from the `sdc.operation.type` header when
//! present (1 = insert, 2 = delete, 3 = update, 4 = upsert); otherwise the
//! configured default applies. Codes the writer cannot handle are treated per
//! [`UnsupportedOperationAction`].

use crate::error::StoreError;
use crate::record::{Record, OPERATION_HEADER};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Write operation applied to a record.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Insert a new row (default)
    #[default]
    Insert,
    /// Update an existing row
    Update,
    /// Delete a row
    Delete,
    /// Insert or update
    Upsert,
}

impl OperationType {
    /// Map a CDC operation code to an operation.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(OperationType::Insert),
            2 => Some(OperationType::Delete),
            3 => Some(OperationType::Update),
            4 => Some(OperationType::Upsert),
            _ => None,
        }
    }

    /// The CDC operation code.
    pub fn code(&self) -> i32 {
        match self {
            OperationType::Insert => 1,
            OperationType::Delete => 2,
            OperationType::Update => 3,
            OperationType::Upsert => 4,
        }
    }

    /// Lower-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Upsert => "upsert",
        }
    }
}

/// What to do with a record whose operation code is not supported.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedOperationAction {
    /// Silently drop the record
    Discard,
    /// Route the record to the error handler (default)
    #[default]
    SendToError,
    /// Apply the default operation instead
    UseDefault,
}

/// Change-log format of incoming records.
///
/// Selects where column values live inside a record body.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeLogFormat {
    /// Plain records (default)
    #[default]
    None,
    /// Microsoft SQL Server change tracking
    #[serde(rename = "mssql")]
    MsSql,
    /// Oracle CDC
    Oracle,
    /// MySQL binary log, values under `/Data`
    #[serde(rename = "mysql_binlog")]
    MySqlBinLog,
    /// MongoDB oplog, values under `/o`
    #[serde(rename = "mongodb_oplog")]
    MongoOpLog,
}

impl ChangeLogFormat {
    /// The value holding column data for a record in this format.
    pub fn row_values<'a>(&self, record: &'a Record) -> Option<&'a Value> {
        match self {
            ChangeLogFormat::None | ChangeLogFormat::MsSql | ChangeLogFormat::Oracle => {
                Some(&record.value)
            }
            ChangeLogFormat::MySqlBinLog => record.value.get("Data"),
            ChangeLogFormat::MongoOpLog => record.value.get("o"),
        }
    }
}

/// Resolve the operation for a record.
///
/// Returns `Ok(None)` when the record should be discarded.
pub fn resolve_operation(
    record: &Record,
    default: OperationType,
    unsupported: UnsupportedOperationAction,
) -> Result<Option<OperationType>, StoreError> {
    let Some(raw) = record.header(OPERATION_HEADER) else {
        return Ok(Some(default));
    };

    let parsed = raw.trim().parse::<i32>().ok().and_then(OperationType::from_code);
    match (parsed, unsupported) {
        (Some(op), _) => Ok(Some(op)),
        (None, UnsupportedOperationAction::Discard) => Ok(None),
        (None, UnsupportedOperationAction::UseDefault) => Ok(Some(default)),
        (None, UnsupportedOperationAction::SendToError) => Err(StoreError::UnsupportedOperation(
            format!("operation code '{}' on record '{}'", raw, record.id),
        )),
    }
}
