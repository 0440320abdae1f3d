//! # odbinit check
//!
//! Attaches to an existing arena and prints the self-check report.

use anyhow::{Context, Result};
use console::{style, Emoji};

use odb_core::{Odb, OdbError};

use crate::Target;

static CHECK: Emoji<'_, '_> = Emoji("✔ ", "[ok] ");
static CROSS: Emoji<'_, '_> = Emoji("✘ ", "[!!] ");
static DOT: Emoji<'_, '_> = Emoji("● ", "[-] ");

pub fn cmd_check(target: &Target) -> Result<()> {
    let db_cfg = &target.config.database;
    eprintln!("{}", style(format!("Checking {}", db_cfg.path.display())).bold());

    let db = Odb::connect(&db_cfg.path, &db_cfg.lock_path, target.options())
        .context("Failed to attach to database")?;

    match db.check() {
        Ok(tree) => {
            let a = &tree.arena;
            eprintln!("  {} {}", CHECK, style("Arena structure is consistent").green());
            eprintln!("  {} {} keys ({} directories)", DOT, tree.keys, tree.directories);
            eprintln!(
                "  {} {} bytes: {} allocated in {} blocks, {} free in {} blocks",
                DOT, a.capacity, a.allocated, a.used_blocks, a.free, a.free_blocks
            );
            eprintln!("  {} largest free block {} bytes", DOT, a.largest_free);
            Ok(())
        }
        Err(e @ OdbError::Corrupted { .. }) => {
            eprintln!("  {} {}", CROSS, style(&e).red());
            eprintln!(
                "{}",
                style("Restore from a snapshot with 'odbinit --cleanup' followed by 'odbinit load'.").dim()
            );
            Err(e.into())
        }
        Err(e) => Err(e).context("Self-check could not run"),
    }
}
