//! Records flowing through the sink.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Header carrying the CDC operation code.
pub const OPERATION_HEADER: &str = "sdc.operation.type";

/// A structured record.
///
/// The body is an arbitrary JSON value; headers carry out-of-band attributes
/// such as the CDC operation code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Source position, used to identify the record in error reports
    pub id: String,
    /// Record body
    pub value: Value,
    /// Record headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Record {
    /// Create a record with no headers.
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value,
            headers: HashMap::new(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a field by name or by JSON pointer (`/a/b`).
    pub fn get(&self, path: &str) -> Option<&Value> {
        if path.starts_with('/') {
            self.value.pointer(path)
        } else {
            self.value.get(path)
        }
    }

    /// Look up a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A batch of records handed to the sink in one call.
pub type Batch = Vec<Record>;
