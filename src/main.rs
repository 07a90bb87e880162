//! # Main — CLI Entry Point
//!
//! Routes CLI subcommands to the dashboard server and the one-shot cluster
//! tools. Handles shared concerns: `.env` loading, logging setup and the
//! configuration file.
//!
//! ## Subcommands
//!
//! - `dashboard`: HTTP server plus the background polling scheduler.
//! - `status`: aggregate `daemonstatus.json` over the cluster and print it.
//! - `poll`: run one monitoring round in the foreground and exit.
//!
//! ## Global Options
//!
//! - `--config` / `CRAWLDECK_CONFIG`: TOML settings file (defaults apply when
//!   it does not exist).
//! - `--verbose`: debug logging unless `RUST_LOG` says otherwise.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(
    name = "crawldeck",
    version,
    about = "Monitor and control a cluster of Scrapyd crawl nodes"
)]
struct Cli {
    /// Path to the TOML settings file
    #[arg(long, env = "CRAWLDECK_CONFIG", default_value = "crawldeck.toml")]
    config: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the web dashboard and the background polling scheduler
    Dashboard {
        /// Address to bind (overrides dashboard.bind)
        #[arg(long, env = "CRAWLDECK_BIND")]
        bind: Option<String>,
        /// Port to listen on (overrides dashboard.port)
        #[arg(long, env = "CRAWLDECK_PORT")]
        port: Option<u16>,
    },
    /// Print the daemon status of every node as JSON
    Status {
        /// Comma-separated node indices, e.g. 1,3 (default: all nodes)
        #[arg(long)]
        nodes: Option<String>,
    },
    /// Run a single monitoring round and print its report
    Poll,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // LOG_FORMAT=json for log shippers, human-readable on stderr otherwise
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let settings = crawldeck::config::load(&cli.config)?;

    match &cli.command {
        Commands::Dashboard { bind, port } => cli::run_dashboard(settings, bind.clone(), *port),
        Commands::Status { nodes } => cli::run_status(&settings, nodes.as_deref()),
        Commands::Poll => cli::run_poll(&settings),
    }
}
