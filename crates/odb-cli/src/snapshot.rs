//! # odbinit dump / load

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use odb_core::{Odb, SnapshotFormat};

use crate::Target;

pub fn cmd_dump(target: &Target, odb_path: &str, format: SnapshotFormat) -> Result<()> {
    let db_cfg = &target.config.database;
    let db = Odb::connect(&db_cfg.path, &db_cfg.lock_path, target.options())
        .context("Failed to attach to database")?;
    let text = db
        .dump(odb_path, format)
        .with_context(|| format!("Failed to dump {odb_path}"))?;
    println!("{}", text.trim_end());
    Ok(())
}

pub fn cmd_load(target: &Target, file: &Path, at: &str) -> Result<()> {
    let db_cfg = &target.config.database;
    let db = Odb::connect(&db_cfg.path, &db_cfg.lock_path, target.options())
        .context("Failed to attach to database")?;
    db.load(file, at)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    db.sync()?;
    eprintln!(
        "{} {} into {}",
        style("Loaded").green().bold(),
        file.display(),
        style(at).cyan()
    );
    Ok(())
}
