//! Write command implementation.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tabsink_core::store::jsonl::{JsonlDataSource, JsonlDataSourceProvider, JsonlWriterFactory};
use tabsink_core::{Config, DefaultErrorRecordHandler, Record, TableSink, WriteOutcome};
use tracing::{info, warn};

type Sink = TableSink<JsonlDataSource, JsonlWriterFactory>;

/// Options for one `write` run.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Input file, one record per line
    pub input: PathBuf,
    /// Records per batch
    pub batch_size: usize,
    /// Threads submitting batches
    pub workers: usize,
    /// Where to write routed error records
    pub errors: Option<PathBuf>,
}

/// Totals across every committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub batches: usize,
    pub written: usize,
    pub errored: usize,
    pub discarded: usize,
}

impl Summary {
    fn add(&mut self, outcome: &WriteOutcome) {
        self.batches += 1;
        self.written += outcome.records_written;
        self.errored += outcome.records_errored;
        self.discarded += outcome.records_discarded;
    }

    fn merge(&mut self, other: Summary) {
        self.batches += other.batches;
        self.written += other.written;
        self.errored += other.errored;
        self.discarded += other.discarded;
    }
}

/// Write the input file through a sink and report what happened.
pub fn run(config: Config, options: WriteOptions) -> Result<Summary> {
    anyhow::ensure!(options.batch_size > 0, "Batch size must be greater than zero");
    let workers = options.workers.max(1);

    let records = read_records(&options.input)
        .with_context(|| format!("Failed to read {}", options.input.display()))?;

    let handler = Arc::new(DefaultErrorRecordHandler::new(config.sink.on_record_error));
    let sink = TableSink::open(
        &config,
        &JsonlDataSourceProvider,
        JsonlWriterFactory,
        handler.clone(),
    )?;

    let batches: Vec<&[Record]> = records.chunks(options.batch_size).collect();
    info!(
        records = records.len(),
        batches = batches.len(),
        workers,
        "Writing records"
    );

    let started = Instant::now();
    let result = dispatch(&sink, &batches, workers);

    if let Some(path) = &options.errors {
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let routed = handler.write_ndjson(file)?;
        info!(routed, path = %path.display(), "Error records written");
    } else if !handler.is_empty() {
        warn!(routed = handler.len(), "Error records were routed but not saved");
    }

    let metrics = sink.metrics_text();
    let report = sink.close();
    let summary = result?;

    println!(
        "Wrote {} records in {} batches ({} errored, {} discarded) in {:.2?}",
        summary.written,
        summary.batches,
        summary.errored,
        summary.discarded,
        started.elapsed()
    );
    println!(
        "Released {} writers, {} release errors",
        report.writers_released,
        report.errors.len()
    );
    print!("{}", metrics);

    Ok(summary)
}

/// Hand batches to `workers` threads until every batch is written or one
/// fails.
fn dispatch(sink: &Sink, batches: &[&[Record]], workers: usize) -> Result<Summary> {
    let next = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    let results: Vec<Result<Summary>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(|| worker(sink, batches, &next, &stop)))
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("Worker thread panicked")))
            })
            .collect()
    });

    let mut summary = Summary::default();
    for result in results {
        summary.merge(result?);
    }
    Ok(summary)
}

fn worker(
    sink: &Sink,
    batches: &[&[Record]],
    next: &AtomicUsize,
    stop: &AtomicBool,
) -> Result<Summary> {
    let mut summary = Summary::default();
    while !stop.load(Ordering::SeqCst) {
        let index = next.fetch_add(1, Ordering::SeqCst);
        let Some(batch) = batches.get(index) else {
            break;
        };
        match sink.write_batch(batch) {
            Ok(outcome) => summary.add(&outcome),
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                return Err(anyhow::Error::new(e).context(format!("Batch {} failed", index)));
            }
        }
    }
    Ok(summary)
}

/// Read one record per line.
///
/// A line shaped like a record (`{"id": .., "value": .., "headers": ..}`) is
/// taken as is; any other JSON value becomes the body of a record whose id is
/// its line number.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let value: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("Line {} is not valid JSON", line_no))?;

        let is_record = value.get("id").is_some_and(|id| id.is_string())
            && value.get("value").is_some();
        let record = if is_record {
            serde_json::from_value(value)
                .with_context(|| format!("Line {} is not a valid record", line_no))?
        } else {
            Record::new(format!("line:{}", line_no), value)
        };
        records.push(record);
    }
    Ok(records)
}
