//! Error taxonomy and wire status codes.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::FieldMismatch;
use crate::types::TypeId;

/// Errors returned by every database operation
#[derive(Error, Debug)]
pub enum OdbError {
    #[error("Key not found: {path}")]
    NotFound { path: String },

    #[error("Key already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: TypeId, actual: TypeId },

    #[error("Value truncated: needed {needed} bytes, had room for {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Record structure mismatch ({} field(s))", mismatches.len())]
    SchemaMismatch { mismatches: Vec<FieldMismatch> },

    #[error("Database busy: lock not acquired within {waited:?}")]
    Busy { waited: Duration },

    #[error("Request deadline expired")]
    Timeout,

    #[error("Database corrupted: {detail}")]
    Corrupted { detail: String },

    #[error("Key is read-only: {path}")]
    ReadOnly { path: String },

    #[error("Out of arena space: requested {requested} bytes, largest free block {largest_free}")]
    OutOfSpace { requested: usize, largest_free: usize },

    #[error("Connection to database server lost")]
    ConnectionLost,

    #[error("Invalid type id: {0}")]
    InvalidType(u32),

    #[error("Invalid key name: {name:?}")]
    InvalidName { name: String },

    #[error("Directory not empty: {path}")]
    NotEmpty { path: String },

    #[error("Index {index} out of range (count {count})")]
    OutOfRange { index: usize, count: usize },

    #[error("Syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, OdbError>;

/// Status codes carried over the wire, one per error class
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success = 1,
    NotFound = 312,
    AlreadyExists = 311,
    TypeMismatch = 307,
    Truncated = 308,
    SchemaMismatch = 314,
    Busy = 320,
    Timeout = 321,
    Corrupted = 313,
    ReadOnly = 306,
    OutOfSpace = 304,
    ConnectionLost = 503,
    InvalidType = 318,
    InvalidName = 315,
    NotEmpty = 316,
    OutOfRange = 317,
    Syntax = 319,
    Protocol = 502,
    Io = 501,
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl OdbError {
    pub fn not_found(path: impl Into<String>) -> Self {
        OdbError::NotFound { path: path.into() }
    }

    pub fn corrupted(detail: impl Into<String>) -> Self {
        OdbError::Corrupted {
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            OdbError::NotFound { .. } => Status::NotFound,
            OdbError::AlreadyExists { .. } => Status::AlreadyExists,
            OdbError::TypeMismatch { .. } => Status::TypeMismatch,
            OdbError::Truncated { .. } => Status::Truncated,
            OdbError::SchemaMismatch { .. } => Status::SchemaMismatch,
            OdbError::Busy { .. } => Status::Busy,
            OdbError::Timeout => Status::Timeout,
            OdbError::Corrupted { .. } => Status::Corrupted,
            OdbError::ReadOnly { .. } => Status::ReadOnly,
            OdbError::OutOfSpace { .. } => Status::OutOfSpace,
            OdbError::ConnectionLost => Status::ConnectionLost,
            OdbError::InvalidType(_) => Status::InvalidType,
            OdbError::InvalidName { .. } => Status::InvalidName,
            OdbError::NotEmpty { .. } => Status::NotEmpty,
            OdbError::OutOfRange { .. } => Status::OutOfRange,
            OdbError::Syntax { .. } => Status::Syntax,
            OdbError::Protocol(_) => Status::Protocol,
            OdbError::Io(_) => Status::Io,
        }
    }

    /// Structured detail that travels next to the status code.
    pub fn detail(&self) -> ErrorDetail {
        let mut detail = ErrorDetail {
            message: self.to_string(),
            ..Default::default()
        };
        match self {
            OdbError::NotFound { path }
            | OdbError::AlreadyExists { path }
            | OdbError::ReadOnly { path }
            | OdbError::NotEmpty { path } => detail.path = Some(path.clone()),
            OdbError::InvalidName { name } => detail.path = Some(name.clone()),
            OdbError::TypeMismatch { expected, actual } => {
                detail.types = Some((*expected, *actual));
            }
            OdbError::Truncated { needed, available } => {
                detail.sizes = Some((*needed as u64, *available as u64));
            }
            OdbError::OutOfSpace {
                requested,
                largest_free,
            } => detail.sizes = Some((*requested as u64, *largest_free as u64)),
            OdbError::OutOfRange { index, count } => {
                detail.sizes = Some((*index as u64, *count as u64));
            }
            OdbError::Busy { waited } => detail.sizes = Some((waited.as_millis() as u64, 0)),
            OdbError::InvalidType(id) => detail.sizes = Some((*id as u64, 0)),
            OdbError::Syntax { line, message } => {
                detail.sizes = Some((*line as u64, 0));
                detail.path = Some(message.clone());
            }
            OdbError::SchemaMismatch { mismatches } => detail.mismatches = mismatches.clone(),
            OdbError::Corrupted { detail: text } | OdbError::Protocol(text) => {
                detail.path = Some(text.clone());
            }
            OdbError::Timeout | OdbError::ConnectionLost | OdbError::Io(_) => {}
        }
        detail
    }

    /// Rebuild an error on the client side from a wire status and its detail.
    ///
    /// Returns `None` for [`Status::Success`].
    pub fn from_wire(status: Status, detail: ErrorDetail) -> Option<Self> {
        let path = detail.path.clone().unwrap_or_default();
        let (a, b) = detail.sizes.unwrap_or((0, 0));
        let err = match status {
            Status::Success => return None,
            Status::NotFound => OdbError::NotFound { path },
            Status::AlreadyExists => OdbError::AlreadyExists { path },
            Status::TypeMismatch => {
                let (expected, actual) = detail.types.unwrap_or((TypeId::Key, TypeId::Key));
                OdbError::TypeMismatch { expected, actual }
            }
            Status::Truncated => OdbError::Truncated {
                needed: a as usize,
                available: b as usize,
            },
            Status::SchemaMismatch => OdbError::SchemaMismatch {
                mismatches: detail.mismatches,
            },
            Status::Busy => OdbError::Busy {
                waited: Duration::from_millis(a),
            },
            Status::Timeout => OdbError::Timeout,
            Status::Corrupted => OdbError::Corrupted { detail: path },
            Status::ReadOnly => OdbError::ReadOnly { path },
            Status::OutOfSpace => OdbError::OutOfSpace {
                requested: a as usize,
                largest_free: b as usize,
            },
            Status::ConnectionLost => OdbError::ConnectionLost,
            Status::InvalidType => OdbError::InvalidType(a as u32),
            Status::InvalidName => OdbError::InvalidName { name: path },
            Status::NotEmpty => OdbError::NotEmpty { path },
            Status::OutOfRange => OdbError::OutOfRange {
                index: a as usize,
                count: b as usize,
            },
            Status::Syntax => OdbError::Syntax {
                line: a as usize,
                message: path,
            },
            Status::Protocol => OdbError::Protocol(path),
            Status::Io => OdbError::Io(io::Error::other(detail.message)),
        };
        Some(err)
    }
}

/// Fields of an [`OdbError`] in a form that survives serialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub path: Option<String>,
    pub types: Option<(TypeId, TypeId)>,
    pub sizes: Option<(u64, u64)>,
    pub mismatches: Vec<FieldMismatch>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_stable() {
        assert_eq!(OdbError::not_found("/a").status(), Status::NotFound);
        assert_eq!(OdbError::Timeout.status(), Status::Timeout);
        assert_eq!(OdbError::corrupted("x").status(), Status::Corrupted);
        assert_eq!(Status::Success.code(), 1);
    }

    #[test]
    fn test_wire_detail_roundtrip_keeps_fields() {
        let original = OdbError::OutOfSpace {
            requested: 4096,
            largest_free: 128,
        };
        let rebuilt = OdbError::from_wire(original.status(), original.detail()).unwrap();
        match rebuilt {
            OdbError::OutOfSpace {
                requested,
                largest_free,
            } => {
                assert_eq!(requested, 4096);
                assert_eq!(largest_free, 128);
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = OdbError::not_found("/x/y");
        match OdbError::from_wire(err.status(), err.detail()).unwrap() {
            OdbError::NotFound { path } => assert_eq!(path, "/x/y"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(OdbError::from_wire(Status::Success, ErrorDetail::default()).is_none());
    }

    #[test]
    fn test_type_mismatch_survives_wire() {
        let err = OdbError::TypeMismatch {
            expected: TypeId::Int32,
            actual: TypeId::String,
        };
        match OdbError::from_wire(err.status(), err.detail()).unwrap() {
            OdbError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, TypeId::Int32);
                assert_eq!(actual, TypeId::String);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
