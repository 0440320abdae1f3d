//! Runs the `odbinit` binary against isolated arenas.

use std::process::{Command, Output};

use odb_config::testing::TestEnvironment;
use odb_core::arena::Arena;

fn odbinit(env: &TestEnvironment, args: &[&str]) -> Output {
    let config = env.write_config().unwrap();
    Command::new(env!("CARGO_BIN_EXE_odbinit"))
        .arg("--config")
        .arg(&config)
        .args(args)
        .env_remove("ODB_PATH")
        .env_remove("ODB_LOCK_PATH")
        .env_remove("ODB_SIZE")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_init_creates_then_reconnects() {
    let env = TestEnvironment::new().unwrap();
    assert!(!env.arena_path.exists());

    let first = odbinit(&env, &["init"]);
    assert_eq!(first.status.code(), Some(0), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(env.arena_path.exists());
    assert!(String::from_utf8_lossy(&first.stderr).contains("Created new database"));

    let second = odbinit(&env, &[]);
    assert_eq!(second.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&second.stderr).contains("Connected to existing database"));

    let check = odbinit(&env, &["check"]);
    assert_eq!(check.status.code(), Some(0));
}

#[test]
fn test_dry_run_touches_nothing() {
    let env = TestEnvironment::new().unwrap();
    let out = odbinit(&env, &["--dry-run", "--cleanup"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("would create a new arena"));
    assert!(!env.arena_path.exists());
}

#[test]
fn test_load_then_dump() {
    let env = TestEnvironment::new().unwrap();
    assert_eq!(odbinit(&env, &["init"]).status.code(), Some(0));

    let snap = env
        .create_file("settings.json", br#"{"Gain": 12, "Label": "north", "Enabled": true}"#)
        .unwrap();
    let load = odbinit(&env, &["load", snap.to_str().unwrap(), "--at", "/Settings"]);
    assert_eq!(load.status.code(), Some(0), "{}", String::from_utf8_lossy(&load.stderr));

    let dump = odbinit(&env, &["dump", "/Settings"]);
    assert_eq!(dump.status.code(), Some(0));
    let json: serde_json::Value = serde_json::from_str(&stdout(&dump)).unwrap();
    assert_eq!(json["Gain"], 12);
    assert_eq!(json["Label"], "north");
    assert_eq!(json["Enabled"], true);

    let missing = odbinit(&env, &["dump", "/Nowhere"]);
    assert_eq!(missing.status.code(), Some(1));
}

#[test]
fn test_corrupted_arena_has_distinct_exit_code() {
    let env = TestEnvironment::new().unwrap();
    assert_eq!(odbinit(&env, &["init"]).status.code(), Some(0));

    let mut arena = Arena::open_existing(&env.arena_path).unwrap();
    arena.mark_corrupted();
    drop(arena);

    assert_eq!(odbinit(&env, &["check"]).status.code(), Some(2));
    assert_eq!(odbinit(&env, &["dump"]).status.code(), Some(2));
}

#[test]
fn test_check_without_arena_fails() {
    let env = TestEnvironment::new().unwrap();
    assert_eq!(odbinit(&env, &["check"]).status.code(), Some(1));
}
