//! One logical connection to a store.
//!
//! A `Connection` owns a native handle, a statement pool, a notification
//! hub, an error classifier and the transaction bookkeeping. It is the
//! only type that touches the engine traits directly; everything above
//! it works in terms of SQL text and notifications.

use crate::classifier::{ErrorClassifier, ErrorObserver, IgnorableGuard};
use crate::error::{CoreError, CoreResult, ErrorRecord, Operation};
use crate::global;
use crate::hub::{
    BusyNotification, CheckpointedNotification, CommittedNotification, DidStepNotification,
    InstrumentationHub, PerformanceTracer, SqlTracer, WillStepNotification,
};
use crate::pool::StatementPool;
use crate::statement::{HandleStatement, StatementContext, StatementKind};
use crate::transaction::TransactionState;
use quarrydb_engine::{
    Engine, InterruptHandle, MemoryEngine, NativeError, NativeHandle, Status,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
#[cfg(feature = "cipher")]
use zeroize::Zeroizing;

/// Companion-file suffixes making up a store's file set, the empty
/// suffix being the main file itself.
pub const FILE_SUFFIXES: [&str; 5] = ["", "-wal", "-journal", "-shm", "-backup"];

pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        return path.to_path_buf();
    }
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// A logical connection to one store.
///
/// Not internally synchronized: statements execute on the caller's
/// thread, one at a time. The only cross-thread entry point is the
/// interrupt token from [`Connection::interrupt_handle`].
pub struct Connection {
    pub(crate) path: PathBuf,
    engine: Arc<dyn Engine>,
    pub(crate) handle: Option<Box<dyn NativeHandle>>,
    interrupt: Option<Arc<dyn InterruptHandle>>,
    pub(crate) tag: Option<i64>,
    pool: StatementPool,
    pub(crate) hub: InstrumentationHub,
    pub(crate) classifier: Arc<ErrorClassifier>,
    pub(crate) txn: TransactionState,
    // Set by borrowed statements when a step fails; folded into the
    // nested-scope bookkeeping at the next transaction boundary.
    step_failure: Arc<AtomicBool>,
    #[cfg(feature = "cipher")]
    pending_cipher_key: Option<Zeroizing<Vec<u8>>>,
    changes: u64,
    last_rowid: i64,
}

impl Connection {
    /// Creates a closed connection targeting `path`, backed by the
    /// reference engine.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_engine(path, Arc::new(MemoryEngine::new()))
    }

    /// Creates a closed connection backed by a caller-supplied engine.
    pub fn with_engine(path: impl Into<PathBuf>, engine: Arc<dyn Engine>) -> Self {
        global::initialize();
        Self {
            path: path.into(),
            engine,
            handle: None,
            interrupt: None,
            tag: None,
            pool: StatementPool::new(),
            hub: InstrumentationHub::new(),
            classifier: Arc::new(ErrorClassifier::new()),
            txn: TransactionState::default(),
            step_failure: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "cipher")]
            pending_cipher_key: None,
            changes: 0,
            last_rowid: 0,
        }
    }

    /// Store path this connection targets.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every path in the store's file set, main file first.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        FILE_SUFFIXES
            .iter()
            .map(|suffix| path_with_suffix(&self.path, suffix))
            .collect()
    }

    /// Caller-assigned tag carried on error records and performance
    /// aggregates.
    #[must_use]
    pub fn tag(&self) -> Option<i64> {
        self.tag
    }

    /// Sets or clears the tag.
    pub fn set_tag(&mut self, tag: Option<i64>) {
        self.tag = tag;
    }

    /// Whether the handle is currently open.
    #[must_use]
    pub fn is_opened(&self) -> bool {
        self.handle.is_some()
    }

    /// Opens the native handle. Opening an open connection is a no-op.
    ///
    /// Missing parent directories are created first. A cipher key set
    /// before opening is applied to the fresh handle; if the engine
    /// rejects it, the handle is released and the open fails.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OpenFailure`] when the store cannot be
    /// opened and [`CoreError::CipherFailure`] when a pending key is
    /// rejected.
    pub fn open(&mut self) -> CoreResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Err(self.report_native(
                        Operation::Open,
                        None,
                        NativeError::from(e),
                        CoreError::OpenFailure,
                    ));
                }
            }
        }
        let mut handle = match self.engine.open(&self.path) {
            Ok(handle) => handle,
            Err(e) => {
                return Err(self.report_native(Operation::Open, None, e, CoreError::OpenFailure))
            }
        };
        #[cfg(feature = "cipher")]
        if let Some(key) = &self.pending_cipher_key {
            if let Err(e) = handle.set_cipher_key(key) {
                let _ = handle.close();
                return Err(self.report_native(
                    Operation::SetCipherKey,
                    None,
                    e,
                    CoreError::CipherFailure,
                ));
            }
        }
        self.interrupt = Some(handle.interrupt_handle());
        self.handle = Some(handle);
        self.install_busy_handler();
        self.install_commit_hook();
        self.install_checkpoint_hook();
        tracing::debug!(path = %self.path.display(), "connection opened");
        Ok(())
    }

    /// Closes the native handle. Closing a closed connection is a no-op.
    ///
    /// An open transaction is rolled back first: only committed work may
    /// survive the close. Then pooled statements are finalized, engine
    /// hooks are cleared and the handle is released. The handle is gone
    /// even when the release reports an error.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CloseFailure`] when the engine's final fold
    /// or release fails.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        if self.txn.in_transaction {
            self.rollback_transaction();
        }
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        self.pool.finalize_all();
        self.interrupt = None;
        self.txn = TransactionState::reset_keeping_mode(&self.txn);
        handle.set_busy_handler(None);
        handle.set_commit_hook(None);
        handle.set_checkpoint_hook(None);
        match handle.close() {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "connection closed");
                Ok(())
            }
            Err(e) => Err(self.report_native(Operation::Close, None, e, CoreError::CloseFailure)),
        }
    }

    /// Supplies the cipher key for a transparently encrypted store.
    ///
    /// On a closed connection the key is held and applied at the next
    /// [`Connection::open`]. On an open connection it is handed to the
    /// engine immediately.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CipherFailure`] when the engine rejects the
    /// key.
    #[cfg(feature = "cipher")]
    pub fn set_cipher_key(&mut self, key: &[u8]) -> CoreResult<()> {
        self.pending_cipher_key = Some(Zeroizing::new(key.to_vec()));
        if self.handle.is_none() {
            return Ok(());
        }
        let result = self.handle.as_mut().unwrap().set_cipher_key(key);
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.report_native(
                Operation::SetCipherKey,
                None,
                e,
                CoreError::CipherFailure,
            )),
        }
    }

    /// Stub for builds without cipher support.
    ///
    /// # Panics
    ///
    /// Always. Supplying a key to a build that cannot honor it would
    /// silently leave the store plaintext.
    #[cfg(not(feature = "cipher"))]
    pub fn set_cipher_key(&mut self, _key: &[u8]) -> CoreResult<()> {
        panic!("cipher support is not compiled into this build");
    }

    /// Executes one SQL statement to completion.
    ///
    /// Transaction-control statements are routed through the
    /// transaction manager so its bookkeeping always matches what the
    /// engine saw.
    ///
    /// # Errors
    ///
    /// Returns the classified failure; see [`crate::CoreError`].
    pub fn exec(&mut self, sql: &str) -> CoreResult<()> {
        match StatementKind::classify(sql) {
            StatementKind::Normal => self.execute_internal(sql, StatementKind::Normal),
            StatementKind::BeginTransaction => self.begin_transaction(),
            StatementKind::CommitTransaction => self.commit_or_rollback_transaction(),
            StatementKind::RollbackTransaction => {
                self.rollback_transaction();
                Ok(())
            }
        }
    }

    /// Compiles `sql` into a statement slot for row-by-row stepping.
    ///
    /// Return the slot with [`Connection::return_statement`] when done.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PrepareFailure`] when compilation fails.
    ///
    /// # Panics
    ///
    /// Panics when `sql` is a transaction-control statement. Stepping
    /// one outside the transaction manager would desynchronize its
    /// bookkeeping from the engine; that is a caller bug, not a
    /// recoverable condition.
    pub fn prepare(&mut self, sql: &str) -> CoreResult<HandleStatement> {
        assert!(
            StatementKind::classify(sql) == StatementKind::Normal,
            "transaction-control statements must go through exec, not prepare: {sql}"
        );
        self.hub.trace_sql(sql);
        let mut stmt = self.pool.get_statement();
        if let Err(e) = self.prepare_into(&mut stmt, sql) {
            self.pool.return_statement(stmt);
            let err =
                self.report_native(Operation::Prepare, Some(sql), e, CoreError::PrepareFailure);
            if !err.is_ignored() {
                self.txn.mark_scope_failed();
            }
            return Err(err);
        }
        Ok(stmt)
    }

    /// Returns a statement slot to the pool.
    pub fn return_statement(&mut self, stmt: HandleStatement) {
        self.pool.return_statement(stmt);
    }

    /// Whether `table` exists in the store.
    ///
    /// The probe failure is expected, so it is pushed onto the
    /// ignorable stack and never reaches the error observer.
    ///
    /// # Errors
    ///
    /// Returns failures other than the missing-table probe result.
    pub fn table_exists(&mut self, table: &str) -> CoreResult<bool> {
        let _guard = self.ignore_code(Status::ERROR);
        match self.execute_internal(&format!("SELECT * FROM {table}"), StatementKind::Normal) {
            Ok(()) => Ok(true),
            Err(e) if e.is_ignored() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Rows modified by the most recently finished statement.
    #[must_use]
    pub fn changes(&self) -> u64 {
        self.changes
    }

    /// Row id assigned by the most recent insert.
    #[must_use]
    pub fn last_inserted_row_id(&self) -> i64 {
        self.last_rowid
    }

    /// Whether the underlying store is read-only.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_readonly())
    }

    /// Interrupts the statement currently executing on this connection,
    /// if any. Safe to call from any thread holding a token; this
    /// method is a convenience for the owning thread.
    pub fn interrupt(&self) {
        if let Some(interrupt) = &self.interrupt {
            interrupt.interrupt();
        }
    }

    /// The cross-thread interrupt token, while the connection is open.
    #[must_use]
    pub fn interrupt_handle(&self) -> Option<Arc<dyn InterruptHandle>> {
        self.interrupt.clone()
    }

    // --- error classification -------------------------------------------

    /// Pushes `code` onto the ignorable stack and returns a guard that
    /// pops it on drop.
    #[must_use]
    pub fn ignore_code(&self, code: Status) -> IgnorableGuard {
        self.classifier.ignore_code(code)
    }

    /// Pushes `code` onto the ignorable stack without a guard.
    pub fn mark_error_as_ignorable(&self, code: Status) {
        self.classifier.mark_error_as_ignorable(code);
    }

    /// Pops the most recent ignorable entry.
    pub fn mark_error_as_unignorable(&self) {
        self.classifier.mark_error_as_unignorable();
    }

    /// Installs or clears the error observer for this connection.
    pub fn set_error_observer(&self, observer: Option<ErrorObserver>) {
        self.classifier.set_observer(observer);
    }

    // --- notification registration --------------------------------------

    /// Registers or removes a SQL tracer under `name`.
    pub fn set_sql_tracer(&mut self, name: &str, tracer: Option<SqlTracer>) {
        self.hub.set_sql_tracer(name, tracer);
    }

    /// Registers or removes a performance tracer under `name`.
    pub fn set_performance_tracer(&mut self, name: &str, tracer: Option<PerformanceTracer>) {
        self.hub.set_performance_tracer(name, tracer);
    }

    /// Registers a committed notification under `name` at `priority`.
    ///
    /// Lower priorities dispatch first; ties dispatch in registration
    /// order. Re-registering a name replaces its callback and its
    /// position.
    pub fn set_committed_notification(
        &mut self,
        priority: i32,
        name: &str,
        callback: CommittedNotification,
    ) {
        self.hub.set_committed_notification(priority, name, callback);
        self.install_commit_hook();
    }

    /// Removes the committed notification registered under `name`.
    pub fn unset_committed_notification(&mut self, name: &str) {
        self.hub.unset_committed_notification(name);
        self.install_commit_hook();
    }

    /// Registers or removes a checkpointed notification under `name`.
    pub fn set_checkpointed_notification(
        &mut self,
        name: &str,
        callback: Option<CheckpointedNotification>,
    ) {
        self.hub.set_checkpointed_notification(name, callback);
        self.install_checkpoint_hook();
    }

    /// Registers or removes a busy notification under `name`.
    ///
    /// While any busy notification is registered, contended operations
    /// consult it per attempt instead of failing immediately.
    pub fn set_busy_notification(&mut self, name: &str, callback: Option<BusyNotification>) {
        self.hub.set_busy_notification(name, callback);
        self.install_busy_handler();
    }

    /// Registers or removes a will-step notification under `name`.
    pub fn set_will_step_notification(
        &mut self,
        name: &str,
        callback: Option<WillStepNotification>,
    ) {
        self.hub.set_will_step_notification(name, callback);
    }

    /// Registers or removes a did-step notification under `name`.
    pub fn set_did_step_notification(
        &mut self,
        name: &str,
        callback: Option<DidStepNotification>,
    ) {
        self.hub.set_did_step_notification(name, callback);
    }

    // --- internals -------------------------------------------------------

    pub(crate) fn native_handle_mut(&mut self) -> Option<&mut (dyn NativeHandle + 'static)> {
        self.handle.as_deref_mut()
    }

    fn prepare_into(
        &mut self,
        stmt: &mut HandleStatement,
        sql: &str,
    ) -> quarrydb_engine::NativeResult<()> {
        let handle = self
            .handle
            .as_deref_mut()
            .ok_or_else(|| NativeError::new(Status::MISUSE, "connection is not opened"))?;
        stmt.prepare(handle, sql)?;
        stmt.attach_context(StatementContext {
            classifier: Arc::clone(&self.classifier),
            tag: self.tag,
            path: self.path.clone(),
            failure: Arc::clone(&self.step_failure),
        });
        Ok(())
    }

    /// Folds a pending borrowed-statement failure into the innermost
    /// open nested scope.
    pub(crate) fn absorb_step_failure(&mut self) {
        if self.step_failure.swap(false, Ordering::SeqCst) {
            self.txn.mark_scope_failed();
        }
    }

    pub(crate) fn execute_internal(
        &mut self,
        sql: &str,
        kind: StatementKind,
    ) -> CoreResult<()> {
        self.hub.trace_sql(sql);
        let started = Instant::now();
        let mut stmt = self.pool.get_statement();

        if let Err(e) = self.prepare_into(&mut stmt, sql) {
            self.pool.return_statement(stmt);
            let err = self.report_native(Operation::Prepare, Some(sql), e, CoreError::PrepareFailure);
            // An ignored failure was expected by the caller; it must
            // not poison the enclosing nested scope.
            if !err.is_ignored() {
                self.txn.mark_scope_failed();
            }
            return Err(err);
        }

        // A mutating statement is the moment a lazy savepoint becomes
        // observable; issue any deferred SAVEPOINTs before its first
        // step.
        if kind == StatementKind::Normal && !stmt.is_readonly() && self.txn.has_unmaterialized() {
            if let Err(e) = self.materialize_savepoints() {
                self.pool.return_statement(stmt);
                return Err(e);
            }
        }

        loop {
            self.hub.will_step(&self.path, sql);
            match stmt.step() {
                Ok(has_row) => {
                    self.hub.did_step(&self.path, sql, has_row);
                    if !has_row {
                        break;
                    }
                }
                Err(err) => {
                    // The statement classified and reported the failure;
                    // an ignored one leaves the flag unset and must not
                    // poison the enclosing nested scope.
                    self.pool.return_statement(stmt);
                    self.absorb_step_failure();
                    return Err(err);
                }
            }
        }

        if let Some(handle) = self.handle.as_ref() {
            self.changes = handle.changes();
            self.last_rowid = handle.last_insert_rowid();
        }
        self.pool.return_statement(stmt);
        self.hub.record_cost(self.tag, sql, started.elapsed(), kind);
        Ok(())
    }

    pub(crate) fn report_native(
        &self,
        operation: Operation,
        sql: Option<&str>,
        native: NativeError,
        make: fn(ErrorRecord) -> CoreError,
    ) -> CoreError {
        self.report_native_at(&self.path, operation, sql, native, make)
    }

    pub(crate) fn report_native_at(
        &self,
        path: &Path,
        operation: Operation,
        sql: Option<&str>,
        native: NativeError,
        make: fn(ErrorRecord) -> CoreError,
    ) -> CoreError {
        let severity = self.classifier.classify(&native);
        let record = ErrorRecord::new(operation, path, self.tag, sql, native, severity);
        self.classifier.report(&record);
        make(record)
    }

    fn install_busy_handler(&mut self) {
        let Some(handle) = self.handle.as_deref_mut() else {
            return;
        };
        if self.hub.has_busy() {
            let weak = self.hub.state_weak().unwrap();
            let path = self.path.clone();
            handle.set_busy_handler(Some(Box::new(move |attempts| {
                weak.upgrade()
                    .map_or(false, |state| state.dispatch_busy(&path, attempts))
            })));
        } else {
            handle.set_busy_handler(None);
        }
    }

    fn install_commit_hook(&mut self) {
        let Some(handle) = self.handle.as_deref_mut() else {
            return;
        };
        if self.hub.has_committed() {
            let weak = self.hub.state_weak().unwrap();
            let path = self.path.clone();
            handle.set_commit_hook(Some(Arc::new(move |pages| {
                if let Some(state) = weak.upgrade() {
                    state.dispatch_committed(&path, pages);
                }
            })));
        } else {
            handle.set_commit_hook(None);
        }
    }

    fn install_checkpoint_hook(&mut self) {
        let Some(handle) = self.handle.as_deref_mut() else {
            return;
        };
        if self.hub.has_checkpointed() {
            let weak = self.hub.state_weak().unwrap();
            let path = self.path.clone();
            handle.set_checkpoint_hook(Some(Arc::new(move || {
                if let Some(state) = weak.upgrade() {
                    state.dispatch_checkpointed(&path);
                }
            })));
        } else {
            handle.set_checkpoint_hook(None);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("tag", &self.tag)
            .field("opened", &self.handle.is_some())
            .field("nested_level", &self.txn.nested_level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    fn open_connection(path: &Path) -> Connection {
        let mut conn = Connection::new(path);
        conn.open().unwrap();
        conn
    }

    #[test]
    fn exec_and_derived_accessors() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.exec("CREATE TABLE t (id, name)").unwrap();
        conn.exec("INSERT INTO t VALUES (1, 'a')").unwrap();
        assert_eq!(conn.changes(), 1);
        assert_eq!(conn.last_inserted_row_id(), 1);
        conn.close().unwrap();
    }

    #[test]
    fn open_is_idempotent_and_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deep/nested/store.qdb");
        let mut conn = Connection::new(&path);
        conn.open().unwrap();
        conn.open().unwrap();
        assert!(conn.is_opened());
        conn.exec("CREATE TABLE t (id)").unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.close().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_opened());
    }

    #[test]
    fn exec_on_closed_connection_fails_with_misuse() {
        let mut conn = Connection::new("unopened.qdb");
        let err = conn.exec("CREATE TABLE t (id)").unwrap_err();
        assert_eq!(err.code(), Some(Status::MISUSE));
    }

    #[test]
    fn prepare_and_step_rows() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.exec("CREATE TABLE t (id, name)").unwrap();
        conn.exec("INSERT INTO t VALUES (1, 'a')").unwrap();
        conn.exec("INSERT INTO t VALUES (2, 'b')").unwrap();

        let mut stmt = conn.prepare("SELECT * FROM t").unwrap();
        let mut names = Vec::new();
        while stmt.step().unwrap() {
            names.push(stmt.column_text(1));
        }
        conn.return_statement(stmt);
        assert_eq!(names, vec!["a", "b"]);
        conn.close().unwrap();
    }

    #[test]
    #[should_panic(expected = "transaction-control statements")]
    fn preparing_a_transaction_statement_panics() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        let _ = conn.prepare("BEGIN");
    }

    #[test]
    fn table_exists_probe_is_silent() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        conn.set_error_observer(Some(Arc::new(move |record| {
            sink.lock().push(record.code);
        })));

        assert!(!conn.table_exists("missing").unwrap());
        conn.exec("CREATE TABLE present (id)").unwrap();
        assert!(conn.table_exists("present").unwrap());
        assert!(observed.lock().is_empty());
        conn.close().unwrap();
    }

    #[test]
    fn sql_tracer_sees_executed_text() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        let traced = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&traced);
        conn.set_sql_tracer("test", Some(Arc::new(move |sql| {
            sink.lock().push(sql.to_string());
        })));

        conn.exec("CREATE TABLE t (id)").unwrap();
        conn.set_sql_tracer("test", None);
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(*traced.lock(), vec!["CREATE TABLE t (id)"]);
        conn.close().unwrap();
    }

    #[test]
    fn step_notifications_bracket_each_step() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.exec("CREATE TABLE t (id)").unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();

        let wills = Arc::new(Mutex::new(0usize));
        let rows = Arc::new(Mutex::new(0usize));
        let will_sink = Arc::clone(&wills);
        let row_sink = Arc::clone(&rows);
        conn.set_will_step_notification("test", Some(Arc::new(move |_, _| {
            *will_sink.lock() += 1;
        })));
        conn.set_did_step_notification("test", Some(Arc::new(move |_, _, has_row| {
            if has_row {
                *row_sink.lock() += 1;
            }
        })));

        conn.exec("SELECT * FROM t").unwrap();
        // One row plus the finishing step.
        assert_eq!(*wills.lock(), 2);
        assert_eq!(*rows.lock(), 1);
        conn.close().unwrap();
    }

    #[test]
    fn committed_notification_fires_with_page_count() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        let commits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&commits);
        conn.set_committed_notification(
            0,
            "test",
            Arc::new(move |_path, pages| sink.lock().push(pages)),
        );

        conn.exec("CREATE TABLE t (id)").unwrap();
        conn.exec("BEGIN").unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        conn.exec("COMMIT").unwrap();
        // Schema commit, then the two-row transaction commit.
        assert_eq!(*commits.lock(), vec![1, 2]);

        conn.unset_committed_notification("test");
        conn.exec("INSERT INTO t VALUES (3)").unwrap();
        assert_eq!(commits.lock().len(), 2);
        conn.close().unwrap();
    }

    #[test]
    fn busy_notification_enables_retry() {
        let dir = tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut conn =
            Connection::with_engine(dir.path().join("store.qdb"), engine.clone());
        conn.open().unwrap();
        conn.exec("CREATE TABLE t (id)").unwrap();

        // Without a busy notification, injected contention fails fast.
        engine.inject_busy(1);
        let err = conn.exec("INSERT INTO t VALUES (1)").unwrap_err();
        assert_eq!(err.code(), Some(Status::BUSY));

        let attempts_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&attempts_seen);
        conn.set_busy_notification(
            "test",
            Some(Arc::new(move |_path, attempts| {
                sink.lock().push(attempts);
                true
            })),
        );
        engine.inject_busy(2);
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        // Attempt counts follow the engine's convention: attempts made
        // so far, starting at zero.
        assert_eq!(*attempts_seen.lock(), vec![0, 1]);
        conn.close().unwrap();
    }

    #[test]
    fn interrupt_token_outlives_borrow() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.exec("CREATE TABLE t (id)").unwrap();
        let token = conn.interrupt_handle().unwrap();
        token.interrupt();
        let err = conn.exec("INSERT INTO t VALUES (1)").unwrap_err();
        assert_eq!(err.code(), Some(Status::INTERRUPT));
        // The flag clears once observed; the connection keeps working.
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn paths_cover_the_file_set() {
        let conn = Connection::new("/data/store.qdb");
        let paths = conn.paths();
        assert_eq!(paths.len(), FILE_SUFFIXES.len());
        assert_eq!(paths[0], PathBuf::from("/data/store.qdb"));
        assert_eq!(paths[1], PathBuf::from("/data/store.qdb-wal"));
        assert_eq!(paths[4], PathBuf::from("/data/store.qdb-backup"));
    }

    #[cfg(feature = "cipher")]
    #[test]
    fn cipher_key_set_before_open_encrypts_the_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.qdb");
        {
            let mut conn = Connection::new(&path);
            conn.set_cipher_key(b"passphrase").unwrap();
            conn.open().unwrap();
            conn.exec("CREATE TABLE t (id)").unwrap();
            conn.exec("INSERT INTO t VALUES (1)").unwrap();
            conn.close().unwrap();
        }
        // Reopening without the key must not read the store.
        let mut conn = Connection::new(&path);
        conn.open().unwrap();
        let err = conn.exec("SELECT * FROM t").unwrap_err();
        assert_eq!(err.code(), Some(Status::NOTADB));
        conn.close().unwrap();

        let mut conn = Connection::new(&path);
        conn.set_cipher_key(b"passphrase").unwrap();
        conn.open().unwrap();
        assert!(conn.table_exists("t").unwrap());
        conn.close().unwrap();
    }

    #[test]
    fn drop_mid_transaction_discards_uncommitted_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.qdb");
        {
            let mut conn = Connection::new(&path);
            conn.open().unwrap();
            conn.exec("CREATE TABLE t (id)").unwrap();
            conn.exec("INSERT INTO t VALUES (1)").unwrap();
            conn.exec("BEGIN").unwrap();
            conn.exec("INSERT INTO t VALUES (2)").unwrap();
            // No commit; Drop must not make the second row durable.
        }
        let mut conn = Connection::new(&path);
        conn.open().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM t").unwrap();
        let mut ids = Vec::new();
        while stmt.step().unwrap() {
            ids.push(stmt.column_int(0));
        }
        conn.return_statement(stmt);
        assert_eq!(ids, vec![1]);
        conn.close().unwrap();
    }

    #[test]
    fn drop_closes_the_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.qdb");
        {
            let mut conn = Connection::new(&path);
            conn.open().unwrap();
            conn.exec("CREATE TABLE t (id)").unwrap();
            conn.exec("INSERT INTO t VALUES (1)").unwrap();
            // No explicit close; Drop folds the log.
        }
        assert!(path.exists());
        assert!(!path_with_suffix(&path, "-wal").exists());
    }
}
