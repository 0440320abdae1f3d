//! Client behaviour against a scripted peer on a real Unix socket.

use std::time::Duration;

use odb_core::{OdbError, Status, Value};
use odb_ipc::frame::{read_frame, write_frame};
use odb_ipc::{OdbClient, OdbRequest, Push, RequestEnvelope, ResponsePayload, ServerMessage};
use tempfile::TempDir;
use tokio::net::UnixListener;

fn socket() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("odb.sock");
    (dir, path)
}

#[tokio::test]
async fn test_responses_are_matched_by_seq_and_pushes_are_queued() {
    let (_dir, path) = socket();
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let env: RequestEnvelope = read_frame(&mut stream).await.unwrap().unwrap();
        let OdbRequest::Get { path, .. } = env.request else {
            panic!("expected GET");
        };
        assert_eq!(path, "/Runinfo/State");
        assert!(env.deadline_ms > 0);

        let push = ServerMessage::Record {
            binding: odb_core::BindingId(4),
            values: vec![("count".to_string(), Value::from(1))],
        };
        write_frame(&mut stream, &push).await.unwrap();
        write_frame(&mut stream, &ServerMessage::ok(env.seq, ResponsePayload::Value(Value::from(3))))
            .await
            .unwrap();
        stream
    });

    let mut client = OdbClient::connect_to(&path).await.unwrap();
    assert_eq!(client.get("/Runinfo/State").await.unwrap(), Value::from(3));
    assert!(matches!(
        client.next_push().await,
        Some(Push::Record { binding, .. }) if binding.0 == 4
    ));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_unbounded_timeout_saturates_deadline() {
    let (_dir, path) = socket();
    let listener = UnixListener::bind(&path).unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let env: RequestEnvelope = read_frame(&mut stream).await.unwrap().unwrap();
        write_frame(&mut stream, &ServerMessage::ok(env.seq, ResponsePayload::None))
            .await
            .unwrap();
        (env.deadline_ms, stream)
    });

    let mut client = OdbClient::connect_to(&path).await.unwrap();
    client.set_timeout(Duration::MAX);
    client
        .send(OdbRequest::Delete {
            path: "/x".to_string(),
            recursive: false,
        })
        .await
        .unwrap();
    let (deadline_ms, _stream) = server.await.unwrap();
    assert_eq!(deadline_ms, u64::MAX);
}

#[tokio::test]
async fn test_error_status_becomes_typed_error() {
    let (_dir, path) = socket();
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(Some(env)) = read_frame::<_, RequestEnvelope>(&mut stream).await {
            let reply = ServerMessage::error(env.seq, &OdbError::ReadOnly { path: "/locked".into() });
            write_frame(&mut stream, &reply).await.unwrap();
        }
    });

    let client = OdbClient::connect_to(&path).await.unwrap();
    let err = client.set("/locked", 1).await.unwrap_err();
    assert_eq!(err.status(), Status::ReadOnly);
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let (_dir, path) = socket();
    let listener = UnixListener::bind(&path).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(stream);
    });

    let mut client = OdbClient::connect_to(&path).await.unwrap();
    client.set_timeout(Duration::from_millis(50));
    assert!(matches!(client.get("/x").await, Err(OdbError::Timeout)));
    server.abort();
}

#[tokio::test]
async fn test_closed_connection_is_reported() {
    let (_dir, path) = socket();
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Read one request, then hang up without answering
        let _ = read_frame::<_, RequestEnvelope>(&mut stream).await;
    });

    let client = OdbClient::connect_to(&path).await.unwrap();
    assert!(matches!(client.get("/x").await, Err(OdbError::ConnectionLost)));
    assert!(matches!(client.get("/x").await, Err(OdbError::ConnectionLost)));
    assert!(!client.is_connected());
}
