//! # odb-server
//!
//! Bridge server for processes without direct access to the shared arena.
//!
//! ## Architecture
//!
//! One `odbd` process attaches to the database like any local client and:
//! - serves the wire protocol of `odb-ipc` on a Unix socket
//! - forwards watch deliveries to the connection that registered them
//! - releases a connection's watches and bindings when it closes
//! - polls hotlinks and runs the arena self-check on timers

pub mod commands;
pub mod socket;

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use odb_config::{log_db_error, log_server_info, log_server_warn, Config, ServerConfig};
use odb_core::Odb;

/// Attach to the configured database and serve until SIGINT
pub async fn run_server(config: Config) -> Result<()> {
    let database = config.database.clone();
    info!(
        path = %database.path.display(),
        lock = %database.lock_path.display(),
        capacity = database.capacity,
        "Starting odbd"
    );
    let db = tokio::task::spawn_blocking(move || {
        Odb::open(&database.path, &database.lock_path, database.odb_options("odbd"))
    })
    .await?
    .context("Failed to attach to database")?;

    serve(db, config.server, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
        }
    })
    .await
}

/// Serve `db` on the configured socket until `shutdown` completes
pub async fn serve(db: Odb, config: ServerConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    if config.socket.exists() {
        std::fs::remove_file(&config.socket)
            .with_context(|| format!("Failed to remove stale socket {}", config.socket.display()))?;
    }
    let listener = UnixListener::bind(&config.socket)
        .with_context(|| format!("Failed to bind {}", config.socket.display()))?;
    log_server_info!("Listening", socket = tracing::field::display(config.socket.display()));

    let poll_task = spawn_poll_task(db.clone(), config.poll_interval());
    let check_task = config.check_interval().map(|every| spawn_check_task(db.clone(), every));

    let result = tokio::select! {
        result = socket::run_listener(listener, db.clone(), config.request_timeout()) => result,
        _ = shutdown => Ok(()),
    };

    poll_task.abort();
    if let Some(task) = check_task {
        task.abort();
    }
    if config.socket.exists() {
        let _ = std::fs::remove_file(&config.socket);
    }
    if let Ok(Err(e)) = tokio::task::spawn_blocking(move || db.sync()).await {
        log_server_warn!("Final sync failed", error = tracing::field::display(&e));
    }
    log_server_info!("Server stopped");
    result
}

/// Deliver pending hotlinks on a fixed interval
fn spawn_poll_task(db: Odb, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if db.watch_count() == 0 {
                continue;
            }
            let handle = db.clone();
            match tokio::task::spawn_blocking(move || handle.poll()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(delivered)) => debug!(delivered, "Hotlinks delivered"),
                Ok(Err(e)) => log_server_warn!("Hotlink poll failed", error = tracing::field::display(&e)),
                Err(e) => log_server_warn!("Hotlink poll task failed", error = tracing::field::display(&e)),
            }
        }
    })
}

/// Periodic structural self-check of the arena
fn spawn_check_task(db: Odb, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; attach already checked
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let handle = db.clone();
            match tokio::task::spawn_blocking(move || handle.check()).await {
                Ok(Ok(stats)) => debug!(keys = stats.keys, "Self-check passed"),
                Ok(Err(e)) => log_db_error!("Self-check failed", error = tracing::field::display(&e)),
                Err(e) => log_server_warn!("Self-check task failed", error = tracing::field::display(&e)),
            }
        }
    })
}
