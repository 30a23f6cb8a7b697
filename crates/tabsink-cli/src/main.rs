//! Tabsink CLI - write record files into dynamically named tables.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabsink_core::config::LogFormat;
use tabsink_core::Config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// A batch failed and was rolled back
    WriteError = 2,
    /// Reading input or writing output failed
    IoError = 3,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by looking for a known cause in its chain.
    fn from_error(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(err) = cause.downcast_ref::<tabsink_core::Error>() {
                return match err {
                    tabsink_core::Error::Config(_) | tabsink_core::Error::InvalidConfig { .. } => {
                        ExitCode::ConfigError
                    }
                    tabsink_core::Error::Write(_) => ExitCode::WriteError,
                    tabsink_core::Error::Io(_) => ExitCode::IoError,
                    _ => ExitCode::RuntimeError,
                };
            }
            if cause.downcast_ref::<std::io::Error>().is_some() {
                return ExitCode::IoError;
            }
        }
        ExitCode::RuntimeError
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "tabsink")]
#[command(about = "Batch writer for dynamically named tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a JSON-lines record file through the sink
    Write {
        /// Input file, one record per line
        #[arg(short, long)]
        input: PathBuf,

        /// Override the output directory (connection string)
        #[arg(short, long)]
        output: Option<String>,

        /// Records per batch
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Threads submitting batches concurrently
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Write routed error records to this file as NDJSON
        #[arg(long)]
        errors: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,
}

fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config file when it parses, JSON otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| Config::from_file(path).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map(|m| m.log_level.as_filter())
                    .unwrap_or("info"),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // Logs go to stderr so summaries on stdout stay clean
    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli) {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Write {
            input,
            output,
            batch_size,
            workers,
            errors,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(output) = output {
                config.connection.connection_string = output;
            }
            let options = commands::write::WriteOptions {
                input,
                batch_size,
                workers,
                errors,
            };
            commands::write::run(config, options)?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            commands::validate::run(&config)?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));

    Config::from_file(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
