//! # QuarryDB Core
//!
//! The connection layer sitting between callers and a storage engine.
//!
//! A [`Connection`] owns one native handle and everything wrapped around
//! it:
//! - a statement pool that recycles compiled-statement slots
//! - a transaction manager with lazily materialized nested scopes
//! - name-keyed notification registries for SQL, performance,
//!   committed, checkpointed, busy, and step events
//! - an error classifier with a scoped ignorable-code stack
//! - master-info backup and best-effort recovery of damaged stores
//!
//! ```no_run
//! use quarrydb_core::Connection;
//!
//! # fn main() -> Result<(), quarrydb_core::CoreError> {
//! let mut conn = Connection::new("app.qdb");
//! conn.open()?;
//! conn.exec("CREATE TABLE entries (id, body)")?;
//! conn.begin_transaction()?;
//! conn.exec("INSERT INTO entries VALUES (1, 'hello')")?;
//! conn.commit_or_rollback_transaction()?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classifier;
mod connection;
mod error;
mod global;
mod hub;
mod pool;
mod recovery;
mod statement;
mod transaction;

pub use classifier::{ErrorObserver, IgnorableGuard};
pub use connection::{Connection, FILE_SUFFIXES};
pub use error::{CoreError, CoreResult, ErrorRecord, Operation, Severity};
pub use global::{set_notification_for_global_log, set_notification_when_file_opened};
pub use hub::{
    BusyNotification, CheckpointedNotification, CommittedNotification, DidStepNotification,
    PerformanceTracer, SqlTracer, WillStepNotification,
};
pub use recovery::{recover, recover_with, RecoveryContext, BACKUP_SUFFIX};
pub use statement::{HandleStatement, StatementKind};

pub use quarrydb_engine::{
    Engine, InterruptHandle, NativeError, NativeHandle, NativeResult, NativeStatement, Salvager,
    Status,
};
