//! Sink lifecycle.
//!
//! [`TableSink::open`] validates the configuration, creates the data source
//! and wires the writer cache, cleaner and coordinator together. The sink owns
//! the data source; [`TableSink::close`] releases every cached writer and the
//! data source exactly once.
//!
//! Batches pass through an admission gate. `write_batch` holds it shared for
//! the duration of the batch and `close` takes it exclusively, so teardown
//! waits for in-flight batches and no batch starts after teardown began.

use crate::cache::{Clock, RecordWriterCache, SystemClock, WriterCacheConfig};
use crate::config::Config;
use crate::coordinator::{BatchWriteCoordinator, WriteOutcome};
use crate::error::{ConfigIssue, Error, ResourceError, Result};
use crate::handler::ErrorRecordHandler;
use crate::metrics::SinkMetrics;
use crate::record::Record;
use crate::store::{DataSource, DataSourceProvider, RecordWriter, WriterFactory, WriterSpec};
use crate::template::TemplateResolver;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// What [`TableSink::close`] released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseReport {
    /// Writers released
    pub writers_released: usize,
    /// Failures while releasing the data source
    pub errors: Vec<ResourceError>,
    /// The sink had already been closed; nothing was released
    pub already_closed: bool,
}

/// A destination stage writing batches to dynamically named tables.
pub struct TableSink<D: DataSource, F: WriterFactory> {
    coordinator: BatchWriteCoordinator<D, F>,
    cache: Arc<RecordWriterCache<F>>,
    data_source: Arc<D>,
    metrics: Arc<SinkMetrics>,
    open: RwLock<bool>,
}

impl<D, F> TableSink<D, F>
where
    D: DataSource,
    F: WriterFactory,
    F::Writer: RecordWriter<Connection = D::Connection>,
{
    /// Open a sink with the default cache limits.
    ///
    /// # Arguments
    /// * `config` - Sink, connection and monitoring configuration
    /// * `provider` - Creates the data source from `config.connection`
    /// * `factory` - Builds a writer per resolved table
    /// * `error_handler` - Receives records that fail individually
    ///
    /// # Returns
    /// The open sink, or [`Error::InvalidConfig`] listing every problem found.
    pub fn open<P>(
        config: &Config,
        provider: &P,
        factory: F,
        error_handler: Arc<dyn ErrorRecordHandler>,
    ) -> Result<Self>
    where
        P: DataSourceProvider<Source = D>,
    {
        Self::open_with(
            config,
            provider,
            factory,
            error_handler,
            WriterCacheConfig::default(),
            Arc::new(SystemClock::new()),
        )
    }

    /// Open a sink with custom cache limits and clock.
    pub fn open_with<P>(
        config: &Config,
        provider: &P,
        factory: F,
        error_handler: Arc<dyn ErrorRecordHandler>,
        cache_config: WriterCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        P: DataSourceProvider<Source = D>,
    {
        let resolver = Self::validate(config)?;
        let single_table = resolver.is_constant();

        let data_source = provider
            .create_data_source(&config.connection)
            .map_err(|issue| Error::InvalidConfig {
                issues: vec![issue],
            })?;

        // A data source that cannot hand out a connection fails the open.
        if let Err(e) = data_source.connection() {
            if let Err(close_err) = data_source.close() {
                let err = ResourceError::DataSourceClose(close_err.to_string());
                warn!(error = %err, "Failed to release data source after failed open");
            }
            return Err(Error::InvalidConfig {
                issues: vec![ConfigIssue::new(
                    "connection",
                    "connection_string",
                    format!("Data source is unreachable: {}", e),
                )],
            });
        }

        let data_source = Arc::new(data_source);
        let cache = Arc::new(RecordWriterCache::with_config(
            factory,
            WriterSpec::from_config(&config.sink),
            cache_config,
            clock,
        ));
        let metrics = Arc::new(SinkMetrics::new());
        let coordinator = BatchWriteCoordinator::new(
            Arc::new(resolver),
            Arc::clone(&data_source),
            Arc::clone(&cache),
            error_handler,
            config.sink.rollback_on_error,
            Arc::clone(&metrics),
        );

        info!(
            template = %config.sink.table_name_template,
            single_table,
            schema = %config.sink.schema,
            rollback_on_error = config.sink.rollback_on_error,
            multi_row = config.sink.use_multi_row_op,
            cache_capacity = cache.config().capacity,
            "Sink opened"
        );

        Ok(Self {
            coordinator,
            cache,
            data_source,
            metrics,
            open: RwLock::new(true),
        })
    }

    fn validate(config: &Config) -> Result<TemplateResolver> {
        let mut issues = config.issues();
        let compiled = TemplateResolver::compile(
            &config.sink.table_name_template,
            config.sink.case_sensitive,
        );

        match compiled {
            Ok(resolver) if issues.is_empty() => Ok(resolver),
            Ok(_) => Err(Error::InvalidConfig { issues }),
            Err(e) => {
                if !issues.iter().any(|i| i.config == "table_name_template") {
                    issues.push(ConfigIssue::new(
                        "sink",
                        "table_name_template",
                        e.to_string(),
                    ));
                }
                Err(Error::InvalidConfig { issues })
            }
        }
    }

    /// Write one batch.
    ///
    /// Fails with [`Error::Closed`] once teardown has begun and with
    /// [`Error::Write`] when the batch was rolled back.
    pub fn write_batch(&self, batch: &[Record]) -> Result<WriteOutcome> {
        let open = self.open.read();
        if !*open {
            return Err(Error::Closed);
        }
        Ok(self.coordinator.write_batch(batch)?)
    }

    /// The batch coordinator.
    pub fn coordinator(&self) -> &BatchWriteCoordinator<D, F> {
        &self.coordinator
    }
}

impl<D: DataSource, F: WriterFactory> TableSink<D, F> {
    /// Close the sink.
    ///
    /// Waits for in-flight batches, then releases every cached writer and the
    /// data source. Release failures are logged and reported, never raised.
    /// Calling `close` again is a no-op.
    pub fn close(&self) -> CloseReport {
        let mut open = self.open.write();
        if !*open {
            return CloseReport {
                already_closed: true,
                ..Default::default()
            };
        }
        *open = false;

        let writers_released = self.cache.invalidate_all();
        let mut errors = Vec::new();
        if let Err(e) = self.data_source.close() {
            let err = ResourceError::DataSourceClose(e.to_string());
            warn!(error = %err, "Failed to close data source");
            errors.push(err);
        }

        info!(writers_released, "Sink closed");
        CloseReport {
            writers_released,
            errors,
            already_closed: false,
        }
    }

    /// Whether the sink has been closed.
    pub fn is_closed(&self) -> bool {
        !*self.open.read()
    }

    /// The writer cache.
    pub fn cache(&self) -> &Arc<RecordWriterCache<F>> {
        &self.cache
    }

    /// The data source.
    pub fn data_source(&self) -> &Arc<D> {
        &self.data_source
    }

    /// Sink metrics.
    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    /// Sink and cache metrics in Prometheus text format.
    pub fn metrics_text(&self) -> String {
        self.metrics
            .export_prometheus_text(&self.cache.stats().snapshot())
    }
}

impl<D: DataSource, F: WriterFactory> Drop for TableSink<D, F> {
    fn drop(&mut self) {
        self.close();
    }
}
