//! Remote clients against a live server on a real socket.

use std::time::Duration;

use odb_config::testing::TestEnvironment;
use odb_core::{schema, BindMode, Node, Odb, OdbError, Status, TypeId, Value};
use odb_ipc::{OdbClient, Push};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    env: TestEnvironment,
    db: Odb,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn client(&self) -> OdbClient {
        let client = OdbClient::connect_to(&self.env.socket_path).await.unwrap();
        client.handshake("test").await.unwrap();
        client
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
        assert!(!self.env.is_socket_present());
    }
}

async fn start() -> Running {
    let env = TestEnvironment::new().unwrap();
    let db = Odb::open(&env.arena_path, &env.lock_path, env.odb_options()).unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(odb_server::serve(db.clone(), env.config().server, async {
        let _ = stopped.await;
    }));

    for _ in 0..200 {
        if env.is_socket_present() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Running {
        env,
        db,
        stop: Some(stop),
        task,
    }
}

async fn eventually(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_remote_operations_mirror_local_ones() {
    let server = start().await;
    let client = server.client().await;

    client.set("/Equipment/Trigger/Rate", 2.5).await.unwrap();
    assert_eq!(server.db.get("/Equipment/Trigger/Rate").unwrap(), Value::from(2.5));
    assert_eq!(client.get("/Equipment/Trigger/Rate").await.unwrap(), Value::from(2.5));

    let info = client.create("/Equipment/Trigger/Mask", TypeId::UInt32, 4).await.unwrap();
    assert_eq!(info.num_values, 4);
    assert!(matches!(
        client.create("/Equipment/Trigger/Mask", TypeId::UInt32, 4).await,
        Err(OdbError::AlreadyExists { .. })
    ));

    let names: Vec<String> = client
        .enumerate("/Equipment/Trigger")
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.name)
        .collect();
    assert_eq!(names, ["Rate", "Mask"]);

    let fetched = client.get_with("/Equipment/Trigger/Mask", TypeId::UInt32, 8).await.unwrap();
    assert_eq!(fetched.status, Status::Truncated);
    assert_eq!(fetched.value, Value::UInt32(vec![0, 0]));

    let Node::Dir(entries) = client.export("/Equipment").await.unwrap() else {
        panic!("expected a directory");
    };
    assert_eq!(entries.len(), 1);

    client.delete("/Equipment", true).await.unwrap();
    assert!(matches!(client.find("/Equipment").await, Err(OdbError::NotFound { .. })));
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_watch_receives_coalesced_push() {
    let server = start().await;
    let mut watcher = server.client().await;
    let writer = server.client().await;

    writer.set("/Runinfo/State", 1).await.unwrap();
    let id = watcher.watch("/Runinfo", true).await.unwrap();
    for state in 2..=5 {
        writer.set("/Runinfo/State", state).await.unwrap();
    }

    let push = tokio::time::timeout(Duration::from_secs(2), watcher.next_push())
        .await
        .unwrap()
        .unwrap();
    let Push::Notify(n) = push else {
        panic!("expected a notification, got {push:?}");
    };
    assert_eq!(n.watch_id, id);
    assert_eq!(n.path, "/Runinfo");

    watcher.unwatch(id).await.unwrap();
    assert!(matches!(watcher.unwatch(id).await, Err(OdbError::NotFound { .. })));
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_binding_flush_and_refresh() {
    let server = start().await;
    let client = server.client().await;
    let fields = schema::parse("count = INT : 0\nlabel = STRING : [16] idle\n").unwrap();

    let bound = client.bind("/Rec", &fields, BindMode::Write, false).await.unwrap();
    assert_eq!(bound.values[1], ("label".to_string(), Value::from("idle")));

    let flushed = client
        .flush(bound.id, vec![("count".to_string(), Value::from(9))], false)
        .await
        .unwrap();
    assert_eq!(flushed, 1);
    assert_eq!(server.db.get("/Rec/count").unwrap(), Value::from(9));

    server.db.set("/Rec/label", "running").unwrap();
    let values = client.refresh(bound.id).await.unwrap();
    assert_eq!(values[1].1, Value::from("running"));

    client.unbind(bound.id).await.unwrap();
    assert_eq!(server.db.binding_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_dropped_connection_releases_watches_but_keeps_data() {
    let server = start().await;
    let client = server.client().await;
    let fields = schema::parse("v = DOUBLE : 1.5\n").unwrap();

    client.set("/Keep/x", 3).await.unwrap();
    client.watch("/Keep", true).await.unwrap();
    client.bind("/Keep/rec", &fields, BindMode::Read, true).await.unwrap();
    // One explicit watch plus the binding's internal one
    assert_eq!(server.db.watch_count(), 2);

    drop(client);
    let db = server.db.clone();
    eventually(move || db.watch_count() == 0 && db.binding_count() == 0).await;

    assert_eq!(server.db.get("/Keep/x").unwrap(), Value::from(3));
    assert_eq!(server.db.get("/Keep/rec/v").unwrap(), Value::from(1.5));

    // The exclusive flag went away with the connection
    let other = server.client().await;
    other.bind("/Keep/rec", &fields, BindMode::Write, false).await.unwrap();
    server.shutdown().await;
}
