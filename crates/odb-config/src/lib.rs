//! # odb-config
//!
//! Configuration for the online database tools.
//!
//! Loads configuration from:
//! 1. `~/.odb/config.toml` (global)
//! 2. `.odb/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use odb_core::OdbOptions;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Project-local config file, relative to the working directory
pub const PROJECT_CONFIG: &str = ".odb/config.toml";

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load configuration, using defaults");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global) = Self::global_config_path() {
            layers.push(global);
        }
        layers.push(PathBuf::from(PROJECT_CONFIG));
        Self::load_layers(&layers, |key| std::env::var(key).ok())
    }

    /// Load one explicit file (must exist), then environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.expand_paths();
        Ok(config)
    }

    /// Merge the existing files of `paths` in order, later ones winning key
    /// by key, then apply overrides from `env`
    pub fn load_layers(
        paths: &[PathBuf],
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut table = toml::Table::new();
        for path in paths.iter().filter(|p| p.exists()) {
            debug!(path = %path.display(), "Loading config layer");
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut table, layer);
        }
        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_env_overrides(env);
        config.expand_paths();
        Ok(config)
    }

    /// Global config path: ~/.odb/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".odb/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(path) = env("ODB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(path) = env("ODB_LOCK_PATH") {
            self.database.lock_path = PathBuf::from(path);
        }
        if let Some(socket) = env("ODB_SOCKET") {
            self.server.socket = PathBuf::from(socket);
        }
        if let Some(size) = env("ODB_SIZE") {
            match size.parse() {
                Ok(n) => self.database.capacity = n,
                Err(_) => warn!(value = %size, "Ignoring unparsable ODB_SIZE"),
            }
        }
        if let Some(ms) = env("ODB_LOCK_TIMEOUT_MS") {
            match ms.parse() {
                Ok(n) => self.database.lock_timeout_ms = n,
                Err(_) => warn!(value = %ms, "Ignoring unparsable ODB_LOCK_TIMEOUT_MS"),
            }
        }
    }

    fn expand_paths(&mut self) {
        self.database.path = expand_home(&self.database.path);
        self.database.lock_path = expand_home(&self.database.lock_path);
        self.server.socket = expand_home(&self.server.socket);
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(over)) => merge_tables(inner, over),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Database attachment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name, used to derive default paths
    pub name: String,
    /// Arena backing file (shared memory)
    pub path: PathBuf,
    /// Inter-process lock file
    pub lock_path: PathBuf,
    /// Arena data bytes, fixed at initialization
    pub capacity: usize,
    pub lock_timeout_ms: u64,
    pub check_on_connect: bool,
}

impl DatabaseConfig {
    /// Defaults for a database called `name`
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: PathBuf::from(format!("/dev/shm/odb_{name}")),
            lock_path: PathBuf::from(format!("/tmp/odb_{name}.lock")),
            capacity: odb_core::odb::DEFAULT_CAPACITY,
            lock_timeout_ms: 10_000,
            check_on_connect: true,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Attachment options for a client called `client_name`
    pub fn odb_options(&self, client_name: &str) -> OdbOptions {
        OdbOptions {
            capacity: self.capacity,
            lock_timeout: self.lock_timeout(),
            allow_corrupted: false,
            check_on_connect: self.check_on_connect,
            client_name: client_name.to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::named("ODB")
    }
}

/// Bridge server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket path
    pub socket: PathBuf,
    /// Default deadline for requests that carry none
    pub request_timeout_ms: u64,
    /// Interval of the server's hotlink poll loop
    pub poll_interval_ms: u64,
    /// Interval of the background self-check, 0 disables it
    pub check_interval_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn check_interval(&self) -> Option<Duration> {
        (self.check_interval_secs > 0).then(|| Duration::from_secs(self.check_interval_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/odb.sock"),
            request_timeout_ms: 5_000,
            poll_interval_ms: 100,
            check_interval_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, PathBuf::from("/dev/shm/odb_ODB"));
        assert_eq!(config.database.capacity, 1024 * 1024);
        assert_eq!(config.server.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[database]"));
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("lock_timeout_ms = 10000"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            "ODB_SIZE" => Some("65536".to_string()),
            "ODB_SOCKET" => Some("/run/odb.sock".to_string()),
            "ODB_LOCK_TIMEOUT_MS" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.database.capacity, 65536);
        assert_eq!(config.server.socket, PathBuf::from("/run/odb.sock"));
        assert_eq!(config.database.lock_timeout_ms, 10_000);
    }

    #[test]
    fn test_merge_keeps_unmentioned_keys() {
        let mut base: toml::Table = toml::from_str("[database]\nname = \"A\"\ncapacity = 8192\n").unwrap();
        let overlay: toml::Table = toml::from_str("[database]\ncapacity = 4096\n").unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.database.name, "A");
        assert_eq!(config.database.capacity, 4096);
    }

    #[test]
    fn test_check_interval_zero_disables() {
        let server = ServerConfig {
            check_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(server.check_interval().is_none());
    }
}
