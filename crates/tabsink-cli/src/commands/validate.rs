//! Validate command implementation.

use anyhow::Result;
use std::sync::Arc;
use tabsink_core::store::jsonl::{JsonlDataSourceProvider, JsonlWriterFactory};
use tabsink_core::{Config, DefaultErrorRecordHandler, Error, TableSink};
use tracing::info;

/// Validate the configuration by opening and closing a sink.
///
/// Opening compiles the table name template and creates the data source, so
/// this catches everything `Config::validate` cannot see on its own.
pub fn run(config: &Config) -> Result<()> {
    let handler = Arc::new(DefaultErrorRecordHandler::new(config.sink.on_record_error));
    let sink = match TableSink::open(config, &JsonlDataSourceProvider, JsonlWriterFactory, handler) {
        Ok(sink) => sink,
        Err(Error::InvalidConfig { issues }) => {
            for issue in &issues {
                eprintln!("  {}", issue);
            }
            return Err(Error::InvalidConfig { issues }.into());
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        template = %config.sink.table_name_template,
        connection = %config.connection.connection_string,
        "Configuration opened cleanly"
    );
    sink.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsink_core::config::{ConnectionConfig, SinkConfig};
    use tempfile::TempDir;

    #[test]
    fn test_valid_config() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(
            SinkConfig::new("${table}"),
            ConnectionConfig::new(dir.path().display().to_string()),
        );
        assert!(run(&config).is_ok());
    }

    #[test]
    fn test_invalid_template() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(
            SinkConfig::new("${}"),
            ConnectionConfig::new(dir.path().display().to_string()),
        );
        let err = run(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidConfig { .. })
        ));
    }
}
