//! The native collaborator trait surface.
//!
//! The connection core reaches the storage engine only through these
//! traits. Engines are **opaque**: the core hands them SQL text and file
//! paths and observes results through status codes, derived accessors,
//! and the hooks registered here. The core owns all lifecycle ordering;
//! engines own execution.

use crate::status::NativeResult;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Decides whether a contended operation should be retried.
///
/// Invoked synchronously on the call stack of the blocked operation,
/// once per attempt, with the number of attempts made so far. Returning
/// `true` retries; `false` fails the operation with a busy status.
pub type BusyHandler = Box<dyn FnMut(i32) -> bool + Send>;

/// Invoked after a successful write-ahead-log commit with the number of
/// pages (frames) written.
pub type CommitHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Invoked when the write-ahead log is folded back into the main store.
pub type CheckpointHook = Arc<dyn Fn() + Send + Sync>;

/// A factory for native handles.
///
/// One engine can open many handles; each handle owns one physical
/// connection to one store file set.
pub trait Engine: Send + Sync {
    /// Opens a handle on the store at `path`, creating the file set on
    /// first commit if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be opened.
    fn open(&self, path: &Path) -> NativeResult<Box<dyn NativeHandle>>;
}

/// A cross-thread interrupt token for one handle.
///
/// This is the only part of a handle that is safe to use from a thread
/// other than the one executing statements.
pub trait InterruptHandle: Send + Sync {
    /// Causes the handle's in-flight statement to fail promptly.
    fn interrupt(&self);
}

/// One physical connection to a store.
///
/// Handles are not internally synchronized; callers serialize access.
pub trait NativeHandle: Send {
    /// Compiles `sql` into an executable statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement cannot be compiled, including
    /// references to missing tables and undecryptable stores.
    fn prepare(&mut self, sql: &str) -> NativeResult<Box<dyn NativeStatement>>;

    /// Row id assigned by the most recent insert.
    fn last_insert_rowid(&self) -> i64;

    /// Rows modified by the most recently finished statement.
    fn changes(&self) -> u64;

    /// Whether the underlying store is read-only.
    fn is_readonly(&self) -> bool;

    /// Returns the cross-thread interrupt token for this handle.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;

    /// Installs or clears the contention handler.
    fn set_busy_handler(&mut self, handler: Option<BusyHandler>);

    /// Installs or clears the write-ahead-log commit hook.
    fn set_commit_hook(&mut self, hook: Option<CommitHook>);

    /// Installs or clears the checkpoint hook.
    fn set_checkpoint_hook(&mut self, hook: Option<CheckpointHook>);

    /// Supplies the cipher key for a transparently encrypted store.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the key.
    fn set_cipher_key(&mut self, key: &[u8]) -> NativeResult<()>;

    /// Serializes the store's schema/master information.
    ///
    /// The returned bytes are opaque to callers; they are consumed by a
    /// [`crate::Salvager`] during recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be read.
    fn serialize_master(&mut self) -> NativeResult<Vec<u8>>;

    /// Releases the handle, folding any pending write-ahead-log frames
    /// into the main store first.
    ///
    /// # Errors
    ///
    /// Returns an error if the final fold or release fails.
    fn close(&mut self) -> NativeResult<()>;
}

/// One compiled statement.
pub trait NativeStatement: Send {
    /// Advances execution by one row-step.
    ///
    /// Returns `true` when a row is available, `false` when execution
    /// has finished.
    ///
    /// # Errors
    ///
    /// Returns an error on contention, interrupt, or execution failure.
    fn step(&mut self) -> NativeResult<bool>;

    /// Rewinds the statement so it can be stepped again.
    fn reset(&mut self);

    /// Whether the statement cannot mutate the store.
    fn readonly(&self) -> bool;

    /// Number of columns in the current row.
    fn column_count(&self) -> usize;

    /// Integer value of column `index` in the current row.
    fn column_int(&self, index: usize) -> i64;

    /// Text value of column `index` in the current row.
    fn column_text(&self, index: usize) -> String;
}

type GlobalLog = Box<dyn Fn(i32, &str) + Send + Sync>;
type VfsOpen = Box<dyn Fn(&Path) + Send + Sync>;

static GLOBAL_LOG: RwLock<Option<GlobalLog>> = RwLock::new(None);
static VFS_OPEN: RwLock<Option<VfsOpen>> = RwLock::new(None);

/// Installs the process-wide engine log callback.
///
/// Engines report notable events (salvage skips, fold failures) through
/// this callback. Lives for the process lifetime; there is no teardown.
pub fn set_global_log(log: GlobalLog) {
    *GLOBAL_LOG.write() = Some(log);
}

/// Installs the process-wide notification fired when an engine opens a
/// store file.
pub fn set_vfs_open_notification(notify: VfsOpen) {
    *VFS_OPEN.write() = Some(notify);
}

pub(crate) fn emit_log(code: i32, message: &str) {
    if let Some(log) = GLOBAL_LOG.read().as_ref() {
        log(code, message);
    }
}

pub(crate) fn notify_vfs_open(path: &Path) {
    if let Some(notify) = VFS_OPEN.read().as_ref() {
        notify(path);
    }
}
