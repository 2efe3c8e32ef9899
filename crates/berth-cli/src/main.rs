//! # Berth CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Validate a server list and print the resolved roster
//! berth check -s cache@10.0.0.5:11211*2 -s 10.0.0.6:11211
//!
//! # Build a pool against live servers and print its status
//! berth probe -c servers.json --min 2 --max 8
//! ```
//!
//! Results are printed to stdout as JSON. Logs go to stderr; set `RUST_LOG`
//! to change the level (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use berth::BackoffConfig;
use berth_cli::{check, load_servers, probe, ProbeOptions};

#[derive(FromArgs)]
/// Berth - weighted client-side TCP connection pool tools
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Probe(ProbeArgs),
    Check(CheckArgs),
}

/// Arguments for `berth probe`.
///
/// ```bash
/// berth probe -s 127.0.0.1:6379 -s 127.0.0.1:6380*3 --wait-ms 1000
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "probe")]
/// build a pool, borrow one connection and print the pool status
struct ProbeArgs {
    /// server as [tag@]host:port[*weight], repeatable
    #[argh(option, short = 's', long = "server")]
    servers: Vec<String>,

    /// JSON file holding an array of {host, port, weight?, tag?}
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// idle connections to keep ready
    #[argh(option, default = "1")]
    min: usize,

    /// total connection ceiling
    #[argh(option, default = "4")]
    max: usize,

    /// how long to let the pool fill before borrowing, in milliseconds
    #[argh(option, long = "wait-ms", default = "500")]
    wait_ms: u64,

    /// how long to wait for a connection to borrow, in milliseconds
    #[argh(option, long = "acquire-timeout-ms", default = "1000")]
    acquire_timeout_ms: u64,

    /// per-dial connect timeout, in milliseconds
    #[argh(option, long = "connect-timeout-ms", default = "2000")]
    connect_timeout_ms: u64,

    /// first avoidance window for a failing server, in seconds
    #[argh(option, long = "backoff-initial-secs", default = "120")]
    backoff_initial_secs: u64,

    /// longest avoidance window, in seconds
    #[argh(option, long = "backoff-max-secs", default = "7680")]
    backoff_max_secs: u64,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// validate a server list and print the resolved registry
struct CheckArgs {
    /// server as [tag@]host:port[*weight], repeatable
    #[argh(option, short = 's', long = "server")]
    servers: Vec<String>,

    /// JSON file holding an array of {host, port, weight?, tag?}
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

impl ProbeArgs {
    fn options(&self) -> ProbeOptions {
        ProbeOptions {
            min: self.min,
            max: self.max,
            wait: Duration::from_millis(self.wait_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            backoff: BackoffConfig {
                initial: Duration::from_secs(self.backoff_initial_secs),
                max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so stdout stays clean JSON
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check(args) => {
            let servers = load_servers(&args.servers, args.config.as_deref())?;
            let roster = check(servers)?;
            println!("{}", serde_json::to_string_pretty(&roster)?);
            Ok(())
        }
        Commands::Probe(args) => {
            let servers = load_servers(&args.servers, args.config.as_deref())?;
            tracing::info!("Probing {} servers", servers.len());
            let report = probe(servers, args.options()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
