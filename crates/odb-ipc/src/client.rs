//! Async client for the database server.
//!
//! One background task reads every frame from the socket. Responses are
//! routed to the waiting request by `seq`; pushed notifications and record
//! refreshes are queued for [`OdbClient::next_push`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use odb_core::odb::Fetched;
use odb_core::{
    BindMode, BindingId, ErrorDetail, FieldDesc, KeyInfo, Node, Notification, OdbError,
    RecordLayout, Result, Status, TypeId, Value, WatchId,
};

use crate::frame::{read_frame, write_frame};
use crate::{
    OdbRequest, RecordValues, RequestEnvelope, ResponsePayload, ServerMessage, PROTOCOL_VERSION,
};

/// Default deadline for requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Unsolicited message from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Notify(Notification),
    Record {
        binding: BindingId,
        values: RecordValues,
    },
}

struct Reply {
    status: Status,
    detail: ErrorDetail,
    payload: ResponsePayload,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// A record bound through the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBinding {
    pub id: BindingId,
    pub layout: RecordLayout,
    pub values: RecordValues,
}

pub struct OdbClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_seq: AtomicU64,
    pushes: mpsc::UnboundedReceiver<Push>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl OdbClient {
    /// Connect to the server at the default socket path
    pub async fn connect() -> Result<Self> {
        Self::connect_to(Path::new(crate::default_socket_path())).await
    }

    /// Connect to the server at `socket_path`
    pub async fn connect_to(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (mut read_half, write_half) = stream.into_split();

        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let (push_tx, pushes) = mpsc::unbounded_channel();

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match read_frame::<_, ServerMessage>(&mut read_half).await {
                        Ok(Some(ServerMessage::Response {
                            seq,
                            status,
                            detail,
                            payload,
                        })) => {
                            let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&seq);
                            match waiter {
                                Some(tx) => {
                                    let reply = Reply {
                                        status,
                                        detail,
                                        payload,
                                    };
                                    if tx.send(reply).is_err() {
                                        debug!(seq, "Requester gave up before the response arrived");
                                    }
                                }
                                None => debug!(seq, "Response for an abandoned request"),
                            }
                        }
                        Ok(Some(ServerMessage::Notify(n))) => {
                            if push_tx.send(Push::Notify(n)).is_err() {
                                debug!("Push receiver gone, notification dropped");
                            }
                        }
                        Ok(Some(ServerMessage::Record { binding, values })) => {
                            if push_tx.send(Push::Record { binding, values }).is_err() {
                                debug!(%binding, "Push receiver gone, record dropped");
                            }
                        }
                        Ok(None) => {
                            debug!("Server closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Reading from server failed");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with ConnectionLost
                pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
            })
        };

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            closed,
            next_seq: AtomicU64::new(1),
            pushes,
            reader,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Deadline applied to subsequent requests
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response within the client deadline
    pub async fn send(&self, request: OdbRequest) -> Result<ResponsePayload> {
        let reply = self.exchange(request, self.timeout).await?;
        match OdbError::from_wire(reply.status, reply.detail) {
            None => Ok(reply.payload),
            Some(err) => Err(err),
        }
    }

    async fn exchange(&self, request: OdbRequest, timeout: Duration) -> Result<Reply> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(seq, tx);
        if self.closed.load(Ordering::SeqCst) {
            self.forget(seq);
            return Err(OdbError::ConnectionLost);
        }

        let envelope = RequestEnvelope {
            seq,
            deadline_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            request,
        };
        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &envelope).await
        };
        if let Err(e) = sent {
            self.forget(seq);
            return Err(match e {
                OdbError::Io(_) => OdbError::ConnectionLost,
                other => other,
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(OdbError::ConnectionLost),
            Err(_) => {
                self.forget(seq);
                Err(OdbError::Timeout)
            }
        }
    }

    fn forget(&self, seq: u64) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&seq);
    }

    /// Next pushed message, `None` once the connection is gone
    pub async fn next_push(&mut self) -> Option<Push> {
        self.pushes.recv().await
    }

    /// Pushed message if one is already queued
    pub fn try_push(&mut self) -> Option<Push> {
        self.pushes.try_recv().ok()
    }

    /// Introduce this client; returns the server version and connection id
    pub async fn handshake(&self, client_name: &str) -> Result<(String, u64)> {
        let request = OdbRequest::Handshake {
            client_name: client_name.to_string(),
            protocol: PROTOCOL_VERSION,
        };
        match self.send(request).await? {
            ResponsePayload::Handshake {
                server_version,
                protocol,
                connection,
            } if protocol == PROTOCOL_VERSION => Ok((server_version, connection)),
            ResponsePayload::Handshake { protocol, .. } => Err(OdbError::Protocol(format!(
                "server speaks protocol {protocol}, client {PROTOCOL_VERSION}"
            ))),
            other => Err(unexpected(other)),
        }
    }

    pub async fn find(&self, path: &str) -> Result<KeyInfo> {
        match self.send(OdbRequest::Find { path: path.to_string() }).await? {
            ResponsePayload::Key(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let request = OdbRequest::Get {
            path: path.to_string(),
            as_type: None,
            max_bytes: None,
        };
        match self.send(request).await? {
            ResponsePayload::Value(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    /// Bounded read: the value is converted to `ty` and cut to fit
    /// `max_bytes`; a cut value comes back with [`Status::Truncated`]
    pub async fn get_with(&self, path: &str, ty: TypeId, max_bytes: usize) -> Result<Fetched> {
        let request = OdbRequest::Get {
            path: path.to_string(),
            as_type: Some(ty),
            max_bytes: Some(max_bytes),
        };
        let reply = self.exchange(request, self.timeout).await?;
        match (reply.status, reply.payload) {
            (status @ (Status::Success | Status::Truncated), ResponsePayload::Value(value)) => {
                Ok(Fetched { value, status })
            }
            (status, payload) => match OdbError::from_wire(status, reply.detail) {
                Some(err) => Err(err),
                None => Err(unexpected(payload)),
            },
        }
    }

    pub async fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let request = OdbRequest::Set {
            path: path.to_string(),
            value: value.into(),
        };
        self.send(request).await.map(drop)
    }

    pub async fn create(&self, path: &str, type_id: TypeId, num_values: usize) -> Result<KeyInfo> {
        let request = OdbRequest::Create {
            path: path.to_string(),
            type_id,
            num_values,
        };
        match self.send(request).await? {
            ResponsePayload::Key(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let request = OdbRequest::Delete {
            path: path.to_string(),
            recursive,
        };
        self.send(request).await.map(drop)
    }

    pub async fn enumerate(&self, path: &str) -> Result<Vec<KeyInfo>> {
        match self.send(OdbRequest::Enum { path: path.to_string() }).await? {
            ResponsePayload::Keys(keys) => Ok(keys),
            other => Err(unexpected(other)),
        }
    }

    /// Register a watch; deliveries arrive through [`OdbClient::next_push`]
    pub async fn watch(&self, path: &str, recursive: bool) -> Result<WatchId> {
        let request = OdbRequest::Watch {
            path: path.to_string(),
            recursive,
        };
        match self.send(request).await? {
            ResponsePayload::Watch(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unwatch(&self, watch_id: WatchId) -> Result<()> {
        self.send(OdbRequest::Unwatch { watch_id }).await.map(drop)
    }

    pub async fn bind(
        &self,
        path: &str,
        fields: &[FieldDesc],
        mode: BindMode,
        exclusive: bool,
    ) -> Result<RemoteBinding> {
        let request = OdbRequest::Bind {
            path: path.to_string(),
            fields: fields.to_vec(),
            mode,
            exclusive,
        };
        match self.send(request).await? {
            ResponsePayload::Bound {
                binding,
                layout,
                values,
            } => Ok(RemoteBinding {
                id: binding,
                layout,
                values,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Write `values` through the binding; returns the number of fields flushed
    pub async fn flush(&self, binding: BindingId, values: RecordValues, all: bool) -> Result<usize> {
        match self.send(OdbRequest::Flush { binding, values, all }).await? {
            ResponsePayload::Flushed(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub async fn refresh(&self, binding: BindingId) -> Result<RecordValues> {
        match self.send(OdbRequest::Refresh { binding }).await? {
            ResponsePayload::Record(values) => Ok(values),
            other => Err(unexpected(other)),
        }
    }

    pub async fn export(&self, path: &str) -> Result<Node> {
        match self.send(OdbRequest::Export { path: path.to_string() }).await? {
            ResponsePayload::Tree(node) => Ok(node),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unbind(&self, binding: BindingId) -> Result<()> {
        self.send(OdbRequest::Unbind { binding }).await.map(drop)
    }
}

impl Drop for OdbClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(payload: ResponsePayload) -> OdbError {
    OdbError::Protocol(format!("unexpected response payload {payload:?}"))
}
