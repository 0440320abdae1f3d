//! odbd - online database bridge server
//!
//! Usage:
//!   odbd [--config FILE] [--socket PATH] [--path ARENA] [-v]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use odb_config::logging::{init_logging, LogLevel};
use odb_config::Config;

#[derive(Parser)]
#[command(name = "odbd")]
#[command(version, about = "Online database bridge server", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.odb/config.toml merged with .odb/config.toml)
    #[arg(long, env = "ODB_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Arena backing file
    #[arg(long)]
    path: Option<PathBuf>,

    /// Lock file
    #[arg(long)]
    lock_path: Option<PathBuf>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose.saturating_add(1)));

    let mut config = match &cli.config {
        Some(file) => Config::from_file(file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(socket) = cli.socket {
        config.server.socket = socket;
    }
    if let Some(path) = cli.path {
        config.database.path = path;
    }
    if let Some(lock_path) = cli.lock_path {
        config.database.lock_path = lock_path;
    }

    odb_server::run_server(config).await
}
