//! Sluice CLI - load newline-delimited JSON into ingestion channels.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sluice_core::config::{LogFormat, LogLevel};
use sluice_core::{Config, ErrorKind};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Session could not be established (configure call, stage setup)
    InitializationError = 2,
    /// Control plane rejected a channel operation or broke the protocol
    ChannelError = 3,
    /// Stage upload failed or stage credentials are stale
    UploadError = 4,
    /// Commit confirmation failed or timed out
    CommitError = 5,
    /// Input rows could not be parsed or encoded
    EncodingError = 6,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by the first library error in its chain.
    fn from_error(error: &anyhow::Error) -> Self {
        let kind = error
            .chain()
            .find_map(|e| e.downcast_ref::<sluice_core::Error>())
            .map(|e| e.kind());

        match kind {
            Some(ErrorKind::Config) => ExitCode::ConfigError,
            Some(ErrorKind::Initialization) | Some(ErrorKind::Transport) => {
                ExitCode::InitializationError
            }
            Some(ErrorKind::Channel) | Some(ErrorKind::ProtocolInvariant) => ExitCode::ChannelError,
            Some(ErrorKind::Upload) | Some(ErrorKind::StaleCredential) | Some(ErrorKind::Crypto) => {
                ExitCode::UploadError
            }
            Some(ErrorKind::Commit) => ExitCode::CommitError,
            Some(ErrorKind::Encoding) => ExitCode::EncodingError,
            Some(ErrorKind::Cancelled) => ExitCode::SignalInterrupt,
            Some(ErrorKind::Other) => ExitCode::RuntimeError,
            None => {
                let error_str = error.to_string().to_lowercase();
                if error_str.contains("config") || error_str.contains("toml") {
                    ExitCode::ConfigError
                } else if error_str.contains("json") || error_str.contains("line") {
                    ExitCode::EncodingError
                } else {
                    ExitCode::RuntimeError
                }
            }
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Streaming row ingestion CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert newline-delimited JSON records into a channel
    Ingest {
        /// Channel name from the configuration file
        #[arg(long)]
        channel: String,

        /// Input file (stdin when absent)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Records per inserted blob
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,

        /// Wait until the last batch is committed
        #[arg(long)]
        wait: bool,

        /// Serve /metrics and /healthz on this port while ingesting
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Show the persisted offset token of a channel
    Status {
        /// Channel name from the configuration file
        #[arg(long)]
        channel: String,
    },

    /// Drop a channel
    Drop {
        /// Channel name from the configuration file
        #[arg(long)]
        channel: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config file when it parses; the
    // command reports config errors itself.
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(level_directive(&monitoring.log_level)),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
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

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ingest {
            channel,
            input,
            batch_size,
            wait,
            metrics_port,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let args = commands::ingest::IngestArgs {
                channel,
                input,
                batch_size,
                wait,
                metrics_port,
            };
            commands::ingest::run(config, args).await?;
        }

        Commands::Status { channel } => {
            let config = load_config(cli.config.as_deref())?;
            commands::status::run(config, &channel).await?;
        }

        Commands::Drop { channel } => {
            let config = load_config(cli.config.as_deref())?;
            commands::drop::run(config, &channel).await?;
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            println!(
                "Configuration is valid ({} channel(s) defined)",
                config.channels.len()
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or_else(|| Path::new("sluice.toml"));
    Config::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
