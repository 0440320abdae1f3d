//! # odb-ipc
//!
//! Messages exchanged between remote clients and the database server.
//!
//! Every frame is a 4-byte little-endian length followed by a `bincode`
//! payload. Clients send [`RequestEnvelope`]s; the server answers each with a
//! [`ServerMessage::Response`] carrying the same `seq`, and may interleave
//! pushed [`ServerMessage::Notify`] and [`ServerMessage::Record`] messages at
//! any time.

pub mod client;
pub mod frame;

use serde::{Deserialize, Serialize};

use odb_core::{
    BindMode, BindingId, ErrorDetail, FieldDesc, KeyInfo, Node, Notification, OdbError,
    RecordLayout, Status, TypeId, Value, WatchId,
};

pub use client::{OdbClient, Push, RemoteBinding};

/// Largest accepted frame payload
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bumped on incompatible message changes
pub const PROTOCOL_VERSION: u32 = 1;

/// Default server socket path
pub fn default_socket_path() -> &'static str {
    "/tmp/odb.sock"
}

/// Check if a server socket is present at `path`
pub fn is_server_running(path: &std::path::Path) -> bool {
    path.exists()
}

/// Field values of a bound record, in layout order
pub type RecordValues = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OdbRequest {
    Handshake {
        client_name: String,
        protocol: u32,
    },
    Find {
        path: String,
    },
    Get {
        path: String,
        /// Convert to this type on the server
        as_type: Option<TypeId>,
        /// Caller buffer size; larger values come back truncated
        max_bytes: Option<usize>,
    },
    Set {
        path: String,
        value: Value,
    },
    Create {
        path: String,
        type_id: TypeId,
        num_values: usize,
    },
    Delete {
        path: String,
        recursive: bool,
    },
    Enum {
        path: String,
    },
    Watch {
        path: String,
        recursive: bool,
    },
    Unwatch {
        watch_id: WatchId,
    },
    Bind {
        path: String,
        fields: Vec<FieldDesc>,
        mode: BindMode,
        exclusive: bool,
    },
    /// Store `values` into the server-side buffer, then flush it
    Flush {
        binding: BindingId,
        values: RecordValues,
        all: bool,
    },
    Refresh {
        binding: BindingId,
    },
    Export {
        path: String,
    },
    Unbind {
        binding: BindingId,
    },
}

impl OdbRequest {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OdbRequest::Handshake { .. } => "HANDSHAKE",
            OdbRequest::Find { .. } => "FIND",
            OdbRequest::Get { .. } => "GET",
            OdbRequest::Set { .. } => "SET",
            OdbRequest::Create { .. } => "CREATE",
            OdbRequest::Delete { .. } => "DELETE",
            OdbRequest::Enum { .. } => "ENUM",
            OdbRequest::Watch { .. } => "WATCH",
            OdbRequest::Unwatch { .. } => "UNWATCH",
            OdbRequest::Bind { .. } => "BIND",
            OdbRequest::Flush { .. } => "FLUSH",
            OdbRequest::Refresh { .. } => "REFRESH",
            OdbRequest::Export { .. } => "EXPORT",
            OdbRequest::Unbind { .. } => "UNBIND",
        }
    }
}

/// A request plus the caller's sequence number and deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    /// Milliseconds the caller is willing to wait, 0 for the server default
    pub deadline_ms: u64,
    pub request: OdbRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    None,
    Handshake {
        server_version: String,
        protocol: u32,
        connection: u64,
    },
    Key(KeyInfo),
    Value(Value),
    Keys(Vec<KeyInfo>),
    Watch(WatchId),
    Bound {
        binding: BindingId,
        layout: RecordLayout,
        values: RecordValues,
    },
    Flushed(usize),
    Record(RecordValues),
    Tree(Node),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Response {
        seq: u64,
        status: Status,
        detail: ErrorDetail,
        payload: ResponsePayload,
    },
    /// A watch registered by this connection fired
    Notify(Notification),
    /// A binding of this connection was refreshed by the server
    Record {
        binding: BindingId,
        values: RecordValues,
    },
}

impl ServerMessage {
    pub fn ok(seq: u64, payload: ResponsePayload) -> Self {
        ServerMessage::Response {
            seq,
            status: Status::Success,
            detail: ErrorDetail::default(),
            payload,
        }
    }

    pub fn error(seq: u64, err: &OdbError) -> Self {
        ServerMessage::Response {
            seq,
            status: err.status(),
            detail: err.detail(),
            payload: ResponsePayload::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serialization() {
        let env = RequestEnvelope {
            seq: 7,
            deadline_ms: 250,
            request: OdbRequest::Set {
                path: "/Runinfo/State".to_string(),
                value: Value::from(3),
            },
        };
        let bytes = bincode::serialize(&env).unwrap();
        let decoded: RequestEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.request.kind(), "SET");
    }

    #[test]
    fn test_error_response_keeps_status_and_detail() {
        let err = OdbError::not_found("/missing");
        let msg = ServerMessage::error(3, &err);
        let bytes = bincode::serialize(&msg).unwrap();
        let ServerMessage::Response { seq, status, detail, .. } = bincode::deserialize(&bytes).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(seq, 3);
        assert_eq!(status, Status::NotFound);
        assert!(matches!(
            OdbError::from_wire(status, detail),
            Some(OdbError::NotFound { path }) if path == "/missing"
        ));
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        assert!(path.ends_with(".sock"));
    }
}
