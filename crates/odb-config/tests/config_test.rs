use std::path::PathBuf;

use odb_config::testing::TestEnvironment;
use odb_config::{Config, ConfigError};
use odb_core::{Odb, Value};

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn test_project_layer_overrides_global_key_by_key() {
    let env = TestEnvironment::new().unwrap();
    let global = env
        .create_file(
            "global.toml",
            b"[database]\nname = \"LAB\"\ncapacity = 65536\n\n[server]\npoll_interval_ms = 50\n",
        )
        .unwrap();
    let project = env
        .create_file("project/config.toml", b"[database]\ncapacity = 131072\n")
        .unwrap();

    let config = Config::load_layers(&[global, project], no_env).unwrap();
    assert_eq!(config.database.name, "LAB");
    assert_eq!(config.database.capacity, 131072);
    assert_eq!(config.server.poll_interval_ms, 50);
    assert_eq!(config.server.request_timeout_ms, 5_000);
}

#[test]
fn test_missing_layers_fall_back_to_defaults() {
    let env = TestEnvironment::new().unwrap();
    let config = Config::load_layers(&[env.snapshot_dir.join("absent.toml")], no_env).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_environment_beats_files() {
    let env = TestEnvironment::new().unwrap();
    let file = env
        .create_file("c.toml", b"[database]\npath = \"/dev/shm/odb_file\"\n")
        .unwrap();
    let config = Config::load_layers(&[file], |key| {
        (key == "ODB_PATH").then(|| "/dev/shm/odb_env".to_string())
    })
    .unwrap();
    assert_eq!(config.database.path, PathBuf::from("/dev/shm/odb_env"));
}

#[test]
fn test_malformed_file_is_a_toml_error() {
    let env = TestEnvironment::new().unwrap();
    let file = env.create_file("bad.toml", b"[database\ncapacity = \n").unwrap();
    assert!(matches!(
        Config::load_layers(&[file.clone()], no_env),
        Err(ConfigError::Toml(_))
    ));
    assert!(matches!(
        Config::from_file(&env.snapshot_dir.join("nope.toml")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_environment_config_opens_a_database() {
    let env = TestEnvironment::new().unwrap();
    let db = Odb::open(&env.arena_path, &env.lock_path, env.odb_options()).unwrap();
    db.set("/Experiment/Run number", 7).unwrap();
    assert_eq!(db.get("/Experiment/Run number").unwrap(), Value::from(7));
    let stats = db.stats().unwrap();
    assert_eq!(stats.allocated + stats.free, stats.capacity);
}
