//! # odbinit
//!
//! Bootstrap tool: creates, resets, checks, dumps and reloads the shared
//! database arena.
//!
//! Exit codes: 0 success, 1 failure, 2 arena corrupted, 3 lock busy.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use console::style;

use odb_config::logging::{init_logging, LogLevel};
use odb_config::Config;
use odb_core::{OdbError, OdbOptions, SnapshotFormat};

mod check;
mod init;
mod snapshot;

/// Initialize and maintain the shared online database
#[derive(Parser)]
#[command(name = "odbinit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.odb/config.toml merged with .odb/config.toml)
    #[arg(long, env = "ODB_CONFIG")]
    config: Option<PathBuf>,

    /// Arena backing file
    #[arg(long)]
    path: Option<PathBuf>,

    /// Inter-process lock file
    #[arg(long)]
    lock_path: Option<PathBuf>,

    /// Arena size in bytes, used when the arena is created
    #[arg(short, long)]
    size: Option<usize>,

    /// Discard any existing arena and start empty
    #[arg(long)]
    cleanup: bool,

    /// Report what would be done without touching anything
    #[arg(long)]
    dry_run: bool,

    /// Attach even if the arena is marked corrupted
    #[arg(short = 'C', long)]
    corrupted: bool,

    /// More output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the arena if needed and verify it (default)
    Init,

    /// Run the structural self-check and print arena statistics
    Check,

    /// Print a subtree as JSON or schema text
    Dump {
        /// Database path of the subtree
        #[arg(default_value = "/")]
        odb_path: String,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },

    /// Restore a snapshot file into the database
    Load {
        file: PathBuf,

        /// Database directory to load into
        #[arg(long, default_value = "/")]
        at: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Odb,
}

impl From<Format> for SnapshotFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Json => SnapshotFormat::Json,
            Format::Odb => SnapshotFormat::Odb,
        }
    }
}

/// Resolved settings shared by every command
pub struct Target {
    pub config: Config,
    pub cleanup: bool,
    pub corrupted: bool,
}

impl Target {
    pub fn options(&self) -> OdbOptions {
        OdbOptions {
            allow_corrupted: self.corrupted,
            ..self.config.database.odb_options("odbinit")
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(file) => Config::from_file(file)
            .with_context(|| format!("Failed to load config {}", file.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(path) = cli.path {
        config.database.path = path;
    }
    if let Some(lock_path) = cli.lock_path {
        config.database.lock_path = lock_path;
    }
    if let Some(size) = cli.size {
        config.database.capacity = size;
    }

    let target = Target {
        config,
        cleanup: cli.cleanup,
        corrupted: cli.corrupted,
    };

    if cli.dry_run {
        init::dry_run(&target);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Init) {
        Commands::Init => init::cmd_init(&target),
        Commands::Check => check::cmd_check(&target),
        Commands::Dump { odb_path, format } => snapshot::cmd_dump(&target, &odb_path, format.into()),
        Commands::Load { file, at } => snapshot::cmd_load(&target, &file, &at),
    }
}

/// Distinct exit status for the failures an operator must tell apart
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.chain().find_map(|e| e.downcast_ref::<OdbError>()) {
        Some(OdbError::Corrupted { .. }) => 2,
        Some(OdbError::Busy { .. }) => 3,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        let corrupted = anyhow::Error::new(OdbError::corrupted("bad header")).context("attach");
        assert_eq!(exit_code(&corrupted), 2);
        let busy = anyhow::Error::new(OdbError::Busy {
            waited: Duration::from_secs(1),
        });
        assert_eq!(exit_code(&busy), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_cli_parses_flags_and_subcommand() {
        let cli = Cli::parse_from(["odbinit", "--size", "65536", "--cleanup", "dump", "/Equipment", "--format", "odb"]);
        assert_eq!(cli.size, Some(65536));
        assert!(cli.cleanup);
        assert!(matches!(
            cli.command,
            Some(Commands::Dump { ref odb_path, format: Format::Odb }) if odb_path == "/Equipment"
        ));
    }
}
