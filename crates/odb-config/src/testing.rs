//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - an isolated arena file and lock file
//! - a unique bridge socket path
//! - a scratch directory for snapshots
//!
//! # Usage
//!
//! ```ignore
//! use odb_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let db = odb_core::Odb::open(&env.arena_path, &env.lock_path, env.odb_options()).unwrap();
//!     // the server is NOT auto-started - tests control lifecycle
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use odb_core::OdbOptions;
use tempfile::TempDir;

use crate::{Config, DatabaseConfig};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Arena size used by test environments
pub const TEST_CAPACITY: usize = 256 * 1024;

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    pub arena_path: PathBuf,
    pub lock_path: PathBuf,
    pub socket_path: PathBuf,
    /// Scratch space for snapshot files
    pub snapshot_dir: PathBuf,
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let snapshot_dir = root.join("snapshots");
        std::fs::create_dir_all(&snapshot_dir)?;

        Ok(Self {
            arena_path: root.join(format!("odb-test-{test_id}.shm")),
            lock_path: root.join(format!("odb-test-{test_id}.lock")),
            socket_path: root.join(format!("odb-test-{test_id}.sock")),
            snapshot_dir,
            _temp_dir: temp_dir,
            test_id,
        })
    }

    /// Configuration pointing at this environment's paths
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.database = DatabaseConfig {
            name: format!("test{}", self.test_id),
            path: self.arena_path.clone(),
            lock_path: self.lock_path.clone(),
            capacity: TEST_CAPACITY,
            lock_timeout_ms: 5_000,
            check_on_connect: true,
        };
        cfg.server.socket = self.socket_path.clone();
        cfg.server.poll_interval_ms = 10;
        cfg
    }

    pub fn odb_options(&self) -> OdbOptions {
        self.config().database.odb_options("test")
    }

    /// Write this environment's config to a file and return its path
    pub fn write_config(&self) -> anyhow::Result<PathBuf> {
        let path = self.snapshot_dir.join("config.toml");
        std::fs::write(&path, toml::to_string_pretty(&self.config())?)?;
        Ok(path)
    }

    /// Create a file under the snapshot directory
    pub fn create_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.snapshot_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Check if socket exists (server may be running)
    pub fn is_socket_present(&self) -> bool {
        self.socket_path.exists()
    }

    /// Environment variables that point a spawned `odbd` or `odbinit` at
    /// this environment
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let cfg = self.config();
        vec![
            ("ODB_PATH".to_string(), cfg.database.path.display().to_string()),
            ("ODB_LOCK_PATH".to_string(), cfg.database.lock_path.display().to_string()),
            ("ODB_SIZE".to_string(), cfg.database.capacity.to_string()),
            ("ODB_SOCKET".to_string(), cfg.server.socket.display().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.snapshot_dir.exists());
        assert!(!env.is_socket_present());
    }

    #[test]
    fn test_environment_has_unique_paths() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.socket_path, env2.socket_path);
        assert_ne!(env1.arena_path, env2.arena_path);
    }

    #[test]
    fn test_written_config_loads_back() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_config().unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.database.path, env.arena_path);
        assert_eq!(loaded.server.socket, env.socket_path);
    }

    #[test]
    fn test_env_vars() {
        let env = TestEnvironment::new().unwrap();
        let vars = env.env_vars();
        assert!(vars.iter().any(|(k, _)| k == "ODB_PATH"));
        assert!(vars.iter().any(|(k, v)| k == "ODB_SIZE" && v == "262144"));
    }
}
