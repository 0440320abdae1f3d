//! # odb-core
//!
//! Hierarchical online database shared by the processes of one host.
//!
//! Keys live in a memory-mapped arena; every process maps the same file and
//! serializes access through a two-level lock (in-process mutex plus a
//! `flock` on a lock file). Change notification is pull-based: generations
//! are stamped into the arena on every commit and each process compares them
//! against its watches when it calls [`Odb::poll`].
//!
//! ```no_run
//! use odb_core::{Odb, OdbOptions, Value};
//! # fn main() -> odb_core::Result<()> {
//! let db = Odb::open("/dev/shm/odb_ODB".as_ref(), "/tmp/odb_ODB.lock".as_ref(), OdbOptions::default())?;
//! db.set("/Equipment/Trigger/Settings/Rate", 10.0)?;
//! let rate = db.get("/Equipment/Trigger/Settings/Rate")?;
//! assert_eq!(rate, Value::from(10.0));
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod error;
pub mod export;
pub mod hotlink;
pub mod lock;
pub mod odb;
pub mod record;
pub mod schema;
pub mod tree;
pub mod types;
pub mod value;

pub use arena::ArenaStats;
pub use error::{ErrorDetail, OdbError, Result, Status};
pub use export::{Node, SnapshotFormat};
pub use hotlink::{Event, Notification, NotificationSink, Owner, Payload, WatchId};
pub use odb::{Fetched, Odb, OdbOptions, Released};
pub use record::{BindMode, BindOptions, BindingId, RecordBuffer, RecordLayout};
pub use schema::{FieldDesc, FieldMismatch, MismatchKind};
pub use tree::TreeStats;
pub use types::{KeyInfo, KeyRef, TypeId};
pub use value::Value;
