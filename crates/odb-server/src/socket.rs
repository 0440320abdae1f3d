//! Unix Domain Socket listener for odbd
//!
//! One reader loop and one writer task per connection. Responses and
//! pushed notifications share the connection's outgoing queue, so a
//! notification never splits a response frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use odb_core::{Odb, OdbError};
use odb_ipc::frame::{read_frame, write_frame};
use odb_ipc::{RequestEnvelope, ServerMessage};

use crate::commands::CommandHandler;

/// Messages a connection may have queued before pushes to it are refused
pub const OUTBOX_CAPACITY: usize = 256;

/// Run the UDS accept loop
pub async fn run_listener(listener: UnixListener, db: Odb, request_timeout: Duration) -> Result<()> {
    let next_connection = AtomicU64::new(1);
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let connection = next_connection.fetch_add(1, Ordering::Relaxed);
                let db = db.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, db, connection, request_timeout).await {
                        warn!(conn = connection, error = %e, "Client handler error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
            }
        }
    }
}

/// Serve one connection until the peer goes away, then release what it owned
async fn handle_client(stream: UnixStream, db: Odb, connection: u64, request_timeout: Duration) -> Result<()> {
    debug!(conn = connection, "New client connected");
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOX_CAPACITY);
    let handler = CommandHandler::new(db, connection, tx.clone(), request_timeout);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!(conn = connection, error = %e, "Write to client failed");
                break;
            }
        }
    });

    let outcome = loop {
        let envelope = match read_frame::<_, RequestEnvelope>(&mut reader).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                debug!(conn = connection, "Client disconnected");
                break Ok(());
            }
            Err(OdbError::ConnectionLost) => break Ok(()),
            Err(e) => break Err(e),
        };

        let seq = envelope.seq;
        let h = handler.clone();
        let reply = match tokio::task::spawn_blocking(move || h.handle(envelope)).await {
            Ok(reply) => reply,
            Err(e) => ServerMessage::error(seq, &OdbError::Protocol(format!("request handler failed: {e}"))),
        };
        if tx.send(reply).await.is_err() {
            debug!(conn = connection, "Client stopped reading");
            break Ok(());
        }
    };

    let h = handler.clone();
    match tokio::task::spawn_blocking(move || h.release()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(conn = connection, error = %e, "Failed to release connection resources"),
        Err(e) => warn!(conn = connection, error = %e, "Release task failed"),
    }
    writer_task.abort();
    outcome.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_socket_accepts_connection() {
        let temp = tempdir().unwrap();
        let socket_path = temp.path().join("test.sock");

        let listener = UnixListener::bind(&socket_path).unwrap();

        let socket_path_clone = socket_path.clone();
        let handle = tokio::spawn(async move { UnixStream::connect(&socket_path_clone).await });

        let result = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;

        assert!(result.is_ok());
        handle.await.unwrap().unwrap();
    }
}
