//! CLI argument definitions using clap derive

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// sitecache - offline layer host for the map viewer
///
/// Precaches the build's assets, answers requests the way the offline layer
/// would, and replays mutating API calls queued while offline.
#[derive(Parser, Debug)]
#[command(name = "sitecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "SITECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Precache manifest produced by the build
    #[arg(short, long, global = true, env = "SITECACHE_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Application origin, e.g. https://maps.example.org
    #[arg(long, global = true)]
    pub origin: Option<String>,

    /// API base URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Build mode (production or development)
    #[arg(long, global = true)]
    pub mode: Option<String>,

    /// Storage directory (defaults to the per-origin cache directory)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register the offline layer: install the manifest and evict old generations
    Install,

    /// Show cache generations and queued requests
    Status,

    /// Send one request through the offline layer
    Fetch(FetchArgs),

    /// Replay queued requests now
    Drain,

    /// List queued requests
    Queue,

    /// Register, then keep draining the queue in the background until interrupted
    Run,

    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Absolute URL, or a path resolved against the origin
    pub url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Treat the request as a top-level navigation
    #[arg(long)]
    pub navigate: bool,

    /// Request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Extra header as `name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Write the response body to stdout
    #[arg(long)]
    pub body: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Persist the effective configuration to the default config path
    #[arg(long)]
    pub save: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_args() {
        let cli = Cli::try_parse_from([
            "sitecache",
            "--origin",
            "https://maps.example.org",
            "fetch",
            "-X",
            "POST",
            "/api/site",
            "-d",
            "{}",
            "-H",
            "content-type: application/json",
        ])
        .unwrap();

        assert_eq!(cli.origin.as_deref(), Some("https://maps.example.org"));
        match cli.command {
            Commands::Fetch(args) => {
                assert_eq!(args.method, "POST");
                assert_eq!(args.url, "/api/site");
                assert_eq!(args.data.as_deref(), Some("{}"));
                assert_eq!(args.headers, vec!["content-type: application/json"]);
                assert!(!args.navigate);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
