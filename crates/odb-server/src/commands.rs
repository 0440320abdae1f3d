//! Per-connection request handling.
//!
//! Every request runs against the shared [`Odb`] handle under the
//! connection's [`Owner`], so watches and bindings it creates can be
//! released as a group when the connection goes away.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

use odb_core::record::RecordCallback;
use odb_core::{
    BindOptions, BindingId, ErrorDetail, Notification, NotificationSink, Odb, OdbError, Owner,
    RecordBuffer, Result, Status, WatchId,
};
use odb_ipc::{OdbRequest, RecordValues, RequestEnvelope, ResponsePayload, ServerMessage, PROTOCOL_VERSION};

/// Forwards notifications to a connection's outgoing queue.
///
/// The queue is bounded. A peer that lets it fill up is treated like a
/// closed one: the delivery fails and its watches are dropped.
pub struct ConnectionSink {
    connection: u64,
    tx: Sender<ServerMessage>,
}

impl ConnectionSink {
    pub fn new(connection: u64, tx: Sender<ServerMessage>) -> Self {
        Self { connection, tx }
    }
}

impl NotificationSink for ConnectionSink {
    fn deliver(&self, notification: &Notification) -> bool {
        match self.tx.try_send(ServerMessage::Notify(notification.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.connection, watch_id = %notification.watch_id, "Client is not reading; dropping its watches");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Field values of a record buffer, in layout order
pub fn record_values(buffer: &RecordBuffer) -> Result<RecordValues> {
    buffer
        .layout()
        .fields
        .iter()
        .map(|slot| Ok((slot.name.clone(), buffer.get(&slot.name)?)))
        .collect()
}

#[derive(Default)]
struct Owned {
    watches: HashSet<WatchId>,
    bindings: HashSet<BindingId>,
}

/// Request handler for one connection
#[derive(Clone)]
pub struct CommandHandler {
    db: Odb,
    connection: u64,
    outbox: Sender<ServerMessage>,
    sink: Arc<ConnectionSink>,
    owned: Arc<Mutex<Owned>>,
    default_timeout: Duration,
}

impl CommandHandler {
    pub fn new(db: Odb, connection: u64, outbox: Sender<ServerMessage>, default_timeout: Duration) -> Self {
        Self {
            db,
            connection,
            sink: Arc::new(ConnectionSink::new(connection, outbox.clone())),
            outbox,
            owned: Arc::default(),
            default_timeout,
        }
    }

    pub fn owner(&self) -> Owner {
        Owner::Connection(self.connection)
    }

    /// Handle one request; blocking, run it off the async executor
    pub fn handle(&self, envelope: RequestEnvelope) -> ServerMessage {
        let seq = envelope.seq;
        let kind = envelope.request.kind();
        let deadline = match envelope.deadline_ms {
            0 => self.default_timeout,
            ms => Duration::from_millis(ms),
        };
        // Lock waits never outlast the caller's deadline
        let db = self.db.with_lock_timeout(deadline.min(self.db.options().lock_timeout));

        match self.dispatch(&db, envelope.request) {
            Ok((status, payload)) => {
                debug!(conn = self.connection, seq, kind, "Request served");
                ServerMessage::Response {
                    seq,
                    status,
                    detail: ErrorDetail::default(),
                    payload,
                }
            }
            Err(e) => {
                debug!(conn = self.connection, seq, kind, error = %e, "Request failed");
                ServerMessage::error(seq, &e)
            }
        }
    }

    fn dispatch(&self, db: &Odb, request: OdbRequest) -> Result<(Status, ResponsePayload)> {
        let payload = match request {
            OdbRequest::Handshake { client_name, protocol } => {
                odb_config::log_server_info!(
                    "Handshake",
                    conn = self.connection,
                    client = client_name.as_str(),
                    protocol = protocol
                );
                ResponsePayload::Handshake {
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                    protocol: PROTOCOL_VERSION,
                    connection: self.connection,
                }
            }
            OdbRequest::Find { path } => ResponsePayload::Key(db.key_info(&path)?),
            OdbRequest::Get {
                path,
                as_type,
                max_bytes,
            } => match (as_type, max_bytes) {
                (None, None) => ResponsePayload::Value(db.get(&path)?),
                (Some(ty), None) => ResponsePayload::Value(db.get_as(&path, ty)?),
                (ty, Some(max_bytes)) => {
                    let ty = match ty {
                        Some(ty) => ty,
                        None => db.get(&path)?.type_id(),
                    };
                    let fetched = db.get_with(&path, ty, max_bytes)?;
                    return Ok((fetched.status, ResponsePayload::Value(fetched.value)));
                }
            },
            OdbRequest::Set { path, value } => {
                db.set(&path, value)?;
                ResponsePayload::None
            }
            OdbRequest::Create {
                path,
                type_id,
                num_values,
            } => {
                db.create(&path, type_id, num_values)?;
                ResponsePayload::Key(db.key_info(&path)?)
            }
            OdbRequest::Delete { path, recursive } => {
                db.delete(&path, recursive)?;
                ResponsePayload::None
            }
            OdbRequest::Enum { path } => ResponsePayload::Keys(db.enumerate(&path)?),
            OdbRequest::Watch { path, recursive } => {
                let id = db.watch_for(&path, recursive, self.owner(), self.sink.clone())?;
                self.owned().watches.insert(id);
                ResponsePayload::Watch(id)
            }
            OdbRequest::Unwatch { watch_id } => {
                if !self.owned().watches.remove(&watch_id) {
                    return Err(OdbError::not_found(format!("watch {watch_id}")));
                }
                db.unwatch(watch_id)?;
                ResponsePayload::None
            }
            OdbRequest::Bind {
                path,
                fields,
                mode,
                exclusive,
            } => {
                let mut options = BindOptions::new(mode)
                    .owner(self.owner())
                    .callback(self.refresh_pusher());
                if exclusive {
                    options = options.exclusive();
                }
                let (id, layout) = db.bind_with(&path, &fields, options)?;
                self.owned().bindings.insert(id);
                ResponsePayload::Bound {
                    binding: id,
                    layout: (*layout).clone(),
                    values: record_values(&db.record(id)?)?,
                }
            }
            OdbRequest::Flush { binding, values, all } => {
                self.check_binding(binding)?;
                db.with_record(binding, |record| {
                    values
                        .into_iter()
                        .try_for_each(|(name, value)| record.set(&name, value).map(drop))
                })??;
                let flushed = if all { db.flush_all(binding)? } else { db.flush(binding)? };
                ResponsePayload::Flushed(flushed)
            }
            OdbRequest::Refresh { binding } => {
                self.check_binding(binding)?;
                db.refresh(binding)?;
                ResponsePayload::Record(record_values(&db.record(binding)?)?)
            }
            OdbRequest::Export { path } => ResponsePayload::Tree(db.export(&path)?),
            OdbRequest::Unbind { binding } => {
                self.check_binding(binding)?;
                db.unbind(binding)?;
                self.owned().bindings.remove(&binding);
                ResponsePayload::None
            }
        };
        Ok((Status::Success, payload))
    }

    fn owned(&self) -> std::sync::MutexGuard<'_, Owned> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_binding(&self, id: BindingId) -> Result<()> {
        if self.owned().bindings.contains(&id) {
            Ok(())
        } else {
            Err(OdbError::not_found(format!("binding {id}")))
        }
    }

    /// Callback pushing refreshed record values to this connection
    fn refresh_pusher(&self) -> RecordCallback {
        let outbox = self.outbox.clone();
        let connection = self.connection;
        Arc::new(move |binding, buffer| match record_values(buffer) {
            Ok(values) => {
                if let Err(e) = outbox.try_send(ServerMessage::Record { binding, values }) {
                    debug!(conn = connection, %binding, error = %e, "Refreshed record not queued");
                }
            }
            Err(e) => debug!(conn = connection, %binding, error = %e, "Could not encode refreshed record"),
        })
    }

    /// Drop everything this connection registered; stored data stays
    pub fn release(&self) -> Result<()> {
        let released = self.db.release_owner(self.owner())?;
        let mut owned = self.owned();
        owned.watches.clear();
        owned.bindings.clear();
        odb_config::log_server_info!(
            "Connection released",
            conn = self.connection,
            watches = released.watches,
            bindings = released.bindings
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_core::{schema, BindMode, OdbOptions, Value};
    use tokio::sync::mpsc;

    fn handler_with_capacity(capacity: usize) -> (CommandHandler, mpsc::Receiver<ServerMessage>) {
        let db = Odb::in_memory(OdbOptions::default()).unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        (CommandHandler::new(db, 1, tx, Duration::from_secs(1)), rx)
    }

    fn handler() -> (CommandHandler, mpsc::Receiver<ServerMessage>) {
        handler_with_capacity(16)
    }

    fn request(handler: &CommandHandler, request: OdbRequest) -> (Status, ResponsePayload) {
        match handler.handle(RequestEnvelope {
            seq: 1,
            deadline_ms: 0,
            request,
        }) {
            ServerMessage::Response { status, payload, .. } => (status, payload),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_set_then_get() {
        let (h, _rx) = handler();
        let set = OdbRequest::Set {
            path: "/a/b".to_string(),
            value: Value::from(5),
        };
        assert_eq!(request(&h, set).0, Status::Success);
        let get = OdbRequest::Get {
            path: "/a/b".to_string(),
            as_type: None,
            max_bytes: None,
        };
        assert_eq!(request(&h, get), (Status::Success, ResponsePayload::Value(Value::from(5))));
    }

    #[test]
    fn test_bounded_get_reports_truncation() {
        let (h, _rx) = handler();
        h.db.set("/arr", Value::Int32(vec![1, 2, 3, 4])).unwrap();
        let get = OdbRequest::Get {
            path: "/arr".to_string(),
            as_type: None,
            max_bytes: Some(8),
        };
        assert_eq!(
            request(&h, get),
            (Status::Truncated, ResponsePayload::Value(Value::Int32(vec![1, 2])))
        );
    }

    #[test]
    fn test_foreign_binding_is_not_found() {
        let (h, _rx) = handler();
        let fields = schema::parse("a = INT : 1\n").unwrap();
        let (id, _) = h.db.bind_with("/r", &fields, BindOptions::new(BindMode::Write)).unwrap();
        let (status, _) = request(&h, OdbRequest::Refresh { binding: id });
        assert_eq!(status, Status::NotFound);
    }

    #[test]
    fn test_watch_pushes_through_outbox_and_release_drops_it() {
        let (h, mut rx) = handler();
        h.db.set("/w", 1).unwrap();
        let (_, payload) = request(
            &h,
            OdbRequest::Watch {
                path: "/w".to_string(),
                recursive: false,
            },
        );
        assert!(matches!(payload, ResponsePayload::Watch(_)));

        h.db.set("/w", 2).unwrap();
        assert_eq!(h.db.poll().unwrap(), 1);
        let Ok(ServerMessage::Notify(n)) = rx.try_recv() else {
            panic!("expected a notification");
        };
        assert_eq!(n.value(), Some(&Value::from(2)));

        h.release().unwrap();
        assert_eq!(h.db.watch_count(), 0);
        assert_eq!(h.db.get("/w").unwrap(), Value::from(2));
    }

    #[test]
    fn test_full_outbox_drops_watches_of_idle_client() {
        let (h, mut rx) = handler_with_capacity(2);
        h.db.set("/w", 0).unwrap();
        let watch = |path: &str| OdbRequest::Watch {
            path: path.to_string(),
            recursive: false,
        };
        assert_eq!(request(&h, watch("/w")).0, Status::Success);

        // Two notifications fit, the third finds the queue full
        for i in 1..=2 {
            h.db.set("/w", i).unwrap();
            assert_eq!(h.db.poll().unwrap(), 1);
        }
        assert_eq!(h.db.watch_count(), 1);
        h.db.set("/w", 3).unwrap();
        h.db.poll().unwrap();
        assert_eq!(h.db.watch_count(), 0);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Notify(_))));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Notify(_))));
        assert!(rx.try_recv().is_err());

        // The data is untouched and the connection can still make requests
        let get = OdbRequest::Get {
            path: "/w".to_string(),
            as_type: None,
            max_bytes: None,
        };
        assert_eq!(request(&h, get), (Status::Success, ResponsePayload::Value(Value::from(3))));
    }

    #[test]
    fn test_sink_reports_closed_connection() {
        let (tx, rx) = mpsc::channel(4);
        let sink = ConnectionSink::new(9, tx);
        let note = Notification {
            watch_id: WatchId(1),
            path: "/x".to_string(),
            generation: 1,
            event: odb_core::Event::Deleted,
        };
        assert!(sink.deliver(&note));
        drop(rx);
        assert!(!sink.deliver(&note));
    }
}
