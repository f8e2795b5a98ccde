//! sitecache - command-line host for the map viewer's offline layer.
//!
//! Drives `sitecache-core` against a real origin with a file-backed store.

mod args;
mod commands;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use args::{Cli, Commands};
use sitecache_core::Config;

/// Log file name prefix for `run`; the appender adds the date
const LOG_FILE_NAME: &str = "sitecache.log";

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `-v`. When `log_dir` is given, events are also written to a
/// daily-rolling file there; the returned guard must be held until exit.
fn init_tracing(verbose: u8, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

/// Config file, then `SITECACHE_*` environment, then command-line flags
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env()?;

    if let Some(origin) = &cli.origin {
        config.origin = origin.clone();
    }
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(mode) = &cli.mode {
        config.mode = mode.parse()?;
    }
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = Some(dir.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    let log_dir = match cli.command {
        Commands::Run => Some(config.storage_dir()?.join("logs")),
        _ => None,
    };
    let _guard = init_tracing(cli.verbose, log_dir.as_deref())?;
    info!(origin = %config.origin, mode = ?config.mode, "sitecache starting");

    if let Commands::Config(args) = &cli.command {
        return commands::show_config(&config, args);
    }

    let host = commands::Host::open(config).await?;
    debug!(storage = %host.storage_dir().display(), "Opened store");
    let manifest = cli.manifest.as_deref();

    match cli.command {
        Commands::Install => commands::install(&host, manifest).await,
        Commands::Status => commands::status(&host).await,
        Commands::Fetch(args) => commands::fetch(&host, manifest, args).await,
        Commands::Drain => commands::drain(&host).await,
        Commands::Queue => commands::queue(&host).await,
        Commands::Run => commands::run(&host, manifest).await,
        Commands::Config(_) => Ok(()),
    }
}
