//! Configuration structures for tabsink.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.
//! Writer cache sizing is not part of the file format; see
//! [`crate::cache::WriterCacheConfig`].

use crate::error::ConfigIssue;
use crate::handler::OnRecordError;
use crate::operation::{ChangeLogFormat, OperationType, UnsupportedOperationAction};
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Destination stage configuration
    pub sink: SinkConfig,

    /// Connection pool configuration
    pub connection: ConnectionConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Destination stage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    /// Schema the tables live in (empty for the default schema)
    #[serde(default)]
    pub schema: String,

    /// Table name template, e.g. `events_${region}`
    pub table_name_template: String,

    /// Field to column mappings; unmapped fields map to same-named columns
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,

    /// Treat table and column names case-sensitively
    #[serde(default)]
    pub case_sensitive: bool,

    /// Roll back the whole batch on any write failure
    #[serde(default = "default_rollback_on_error")]
    pub rollback_on_error: bool,

    /// Use multi-row statements
    #[serde(default)]
    pub use_multi_row_op: bool,

    /// Maximum bound parameters per statement (absent means unlimited)
    #[serde(default)]
    pub max_prepared_statement_parameters: Option<usize>,

    /// Maximum cached prepared statements per writer (absent means unlimited)
    #[serde(default)]
    pub max_prepared_statement_cache: Option<usize>,

    /// Change-log format of incoming records
    #[serde(default)]
    pub change_log_format: ChangeLogFormat,

    /// Operation used when a record carries none
    #[serde(default)]
    pub default_operation: OperationType,

    /// What to do with unsupported operation codes
    #[serde(default)]
    pub unsupported_action: UnsupportedOperationAction,

    /// Error-record policy
    #[serde(default)]
    pub on_record_error: OnRecordError,
}

/// Maps a record field to a table column.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FieldMapping {
    /// Field name or JSON pointer in the record
    pub field: String,

    /// Target column name
    pub column: String,

    /// Parameter expression for the column, `?` by default
    #[serde(default = "default_param_value")]
    pub param_value: String,
}

impl FieldMapping {
    /// Create a mapping with the default parameter expression.
    pub fn new(field: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            column: column.into(),
            param_value: default_param_value(),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Connection string understood by the data source provider
    pub connection_string: String,

    /// Username
    #[serde(default)]
    pub username: Option<String>,

    /// Password
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Minimum idle connections
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Connection acquisition timeout in milliseconds
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Idle timeout in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Maximum connection lifetime in milliseconds
    #[serde(default = "default_max_lifetime_ms")]
    pub max_lifetime_ms: u64,
}

impl ConnectionConfig {
    /// Configuration with defaults for everything but the connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            username: None,
            password: None,
            max_connections: default_max_connections(),
            min_idle: default_min_idle(),
            connection_timeout_ms: default_connection_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_lifetime_ms: default_max_lifetime_ms(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_rollback_on_error() -> bool {
    true
}
fn default_param_value() -> String {
    "?".to_string()
}
fn default_max_connections() -> usize {
    10
}
fn default_min_idle() -> usize {
    1
}
fn default_connection_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    600_000
}
fn default_max_lifetime_ms() -> u64 {
    1_800_000
}

impl SinkConfig {
    /// Sink configuration with defaults for everything but the template.
    pub fn new(table_name_template: impl Into<String>) -> Self {
        Self {
            schema: String::new(),
            table_name_template: table_name_template.into(),
            field_mappings: Vec::new(),
            case_sensitive: false,
            rollback_on_error: default_rollback_on_error(),
            use_multi_row_op: false,
            max_prepared_statement_parameters: None,
            max_prepared_statement_cache: None,
            change_log_format: ChangeLogFormat::default(),
            default_operation: OperationType::default(),
            unsupported_action: UnsupportedOperationAction::default(),
            on_record_error: OnRecordError::default(),
        }
    }

    fn collect_issues(&self, issues: &mut Vec<ConfigIssue>) {
        if self.table_name_template.trim().is_empty() {
            issues.push(ConfigIssue::new(
                "sink",
                "table_name_template",
                "Table name template is required",
            ));
        }

        if self.max_prepared_statement_parameters == Some(0) {
            issues.push(ConfigIssue::new(
                "sink",
                "max_prepared_statement_parameters",
                "Must be greater than zero when set",
            ));
        }

        if self.max_prepared_statement_cache == Some(0) {
            issues.push(ConfigIssue::new(
                "sink",
                "max_prepared_statement_cache",
                "Must be greater than zero when set",
            ));
        }

        let mut columns = std::collections::HashSet::new();
        for mapping in &self.field_mappings {
            if mapping.field.is_empty() || mapping.column.is_empty() {
                issues.push(ConfigIssue::new(
                    "sink",
                    "field_mappings",
                    "Field and column must both be set",
                ));
                continue;
            }
            if !mapping.param_value.contains('?') {
                issues.push(ConfigIssue::new(
                    "sink",
                    "field_mappings",
                    format!(
                        "Parameter expression for column '{}' must contain '?'",
                        mapping.column
                    ),
                ));
            }
            let column = if self.case_sensitive {
                mapping.column.clone()
            } else {
                mapping.column.to_lowercase()
            };
            if !columns.insert(column) {
                issues.push(ConfigIssue::new(
                    "sink",
                    "field_mappings",
                    format!("Column '{}' is mapped more than once", mapping.column),
                ));
            }
        }
    }
}

impl ConnectionConfig {
    fn collect_issues(&self, issues: &mut Vec<ConfigIssue>) {
        if self.connection_string.trim().is_empty() {
            issues.push(ConfigIssue::new(
                "connection",
                "connection_string",
                "Connection string is required",
            ));
        }

        if self.max_connections == 0 {
            issues.push(ConfigIssue::new(
                "connection",
                "max_connections",
                "At least one connection required",
            ));
        }

        if self.max_connections > 0 && self.min_idle > self.max_connections {
            issues.push(ConfigIssue::new(
                "connection",
                "min_idle",
                "Must not exceed max_connections",
            ));
        }
    }
}

impl Config {
    /// Build a configuration from its two required sections.
    pub fn new(sink: SinkConfig, connection: ConnectionConfig) -> Self {
        Self {
            sink,
            connection,
            monitoring: MonitoringConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// Only parses; opening a sink validates, so callers may still override
    /// fields after loading.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Collect every configuration issue.
    pub fn issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        self.sink.collect_issues(&mut issues);
        self.connection.collect_issues(&mut issues);
        issues
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let issues = self.issues();
        if !issues.is_empty() {
            return Err(crate::Error::InvalidConfig { issues });
        }

        if self.sink.use_multi_row_op && self.sink.max_prepared_statement_parameters.is_none() {
            tracing::warn!("Multi-row writes without a parameter limit may exceed driver limits");
        }

        Ok(())
    }
}
