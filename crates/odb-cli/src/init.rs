//! # odbinit init
//!
//! Creates the arena and lock file, or resets them with `--cleanup`.

use anyhow::{Context, Result};
use console::{style, Emoji};

use odb_config::{log_cli_info, log_cli_warn};
use odb_core::{Odb, Value};

use crate::Target;

static CHECK: Emoji<'_, '_> = Emoji("✔ ", "[ok] ");
static WARN_ICON: Emoji<'_, '_> = Emoji("⚠ ", "[??] ");

pub fn cmd_init(target: &Target) -> Result<()> {
    let db_cfg = &target.config.database;
    let existed = db_cfg.path.exists();

    eprintln!(
        "Initializing database {} at {} ({} bytes)",
        style(&db_cfg.name).cyan(),
        db_cfg.path.display(),
        db_cfg.capacity
    );

    if target.corrupted {
        eprintln!("  {} {}", WARN_ICON, style("Connecting even if the arena is corrupted").yellow());
        log_cli_warn!("Corrupted override requested", path = tracing::field::display(db_cfg.path.display()));
    }

    let db = if target.cleanup {
        Odb::initialize(&db_cfg.path, &db_cfg.lock_path, target.options())
            .context("Failed to reset database")?
    } else {
        Odb::open(&db_cfg.path, &db_cfg.lock_path, target.options())
            .context("Failed to attach to database")?
    };

    db.get_or_create("/Experiment/Name", &Value::from(db_cfg.name.as_str()))
        .context("Failed to record database name")?;
    let tree = db.check().context("Self-check failed")?;
    db.sync()?;

    let what = match (target.cleanup, existed) {
        (true, true) => "Reset existing database",
        (_, true) => "Connected to existing database",
        (_, false) => "Created new database",
    };
    log_cli_info!("Init complete", keys = tree.keys, existed = existed);
    eprintln!("  {} {}", CHECK, style(what).green());
    eprintln!(
        "  {} {} keys, {} of {} bytes in use",
        CHECK,
        tree.keys,
        tree.arena.allocated,
        tree.arena.capacity
    );
    Ok(())
}

/// Describe what `init` would do
pub fn dry_run(target: &Target) {
    let db_cfg = &target.config.database;
    let existed = db_cfg.path.exists();

    println!("database:  {}", db_cfg.name);
    println!("arena:     {} ({})", db_cfg.path.display(), if existed { "exists" } else { "missing" });
    println!("lock file: {}", db_cfg.lock_path.display());
    println!("size:      {} bytes", db_cfg.capacity);
    let action = match (target.cleanup, existed) {
        (true, true) => "would discard the existing arena and create an empty one",
        (_, true) => "would attach to the existing arena and check it",
        (_, false) => "would create a new arena",
    };
    println!("action:    {action}");
    if target.corrupted {
        println!("override:  would attach even if the arena is marked corrupted");
    }
}
