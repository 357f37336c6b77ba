//! Transaction ordering for one connection.
//!
//! Top-level transactions map to BEGIN / COMMIT / ROLLBACK. Nested
//! scopes map to savepoints named by depth. In lazy mode a nested scope
//! issues no SQL at all until the first mutating statement arrives, so
//! read-only nested work costs nothing.
//!
//! Bookkeeping here mirrors what the engine saw; that is why all
//! transaction-control SQL is funneled through these methods and
//! [`Connection::prepare`](crate::Connection::prepare) refuses it.

use crate::connection::Connection;
use crate::error::CoreResult;
use crate::statement::StatementKind;

/// One nested scope.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NestedLevel {
    /// Whether the scope's SAVEPOINT has been issued to the engine.
    pub(crate) materialized: bool,
    /// Whether a statement failed inside this scope. A failed scope is
    /// rewound before its savepoint is released.
    pub(crate) failed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub(crate) in_transaction: bool,
    pub(crate) lazy_nested: bool,
    pub(crate) levels: Vec<NestedLevel>,
}

impl TransactionState {
    pub(crate) fn nested_level(&self) -> u32 {
        self.levels.len() as u32
    }

    pub(crate) fn has_unmaterialized(&self) -> bool {
        self.levels.iter().any(|level| !level.materialized)
    }

    pub(crate) fn mark_scope_failed(&mut self) {
        if let Some(level) = self.levels.last_mut() {
            level.failed = true;
        }
    }

    /// State for a freshly closed handle: all scopes are gone with the
    /// handle, the laziness setting is the caller's and survives.
    pub(crate) fn reset_keeping_mode(old: &TransactionState) -> TransactionState {
        TransactionState {
            in_transaction: false,
            lazy_nested: old.lazy_nested,
            levels: Vec::new(),
        }
    }
}

fn savepoint_name(depth: usize) -> String {
    format!("quarrydb_savepoint_{depth}")
}

impl Connection {
    /// Whether a top-level transaction is open.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        self.txn.in_transaction
    }

    /// Current nested-scope depth; zero outside any nested scope.
    #[must_use]
    pub fn nested_transaction_level(&self) -> u32 {
        self.txn.nested_level()
    }

    /// Enables or disables lazy nested scopes. Takes effect for scopes
    /// opened after the call.
    pub fn set_lazy_nested_transaction(&mut self, lazy: bool) {
        self.txn.lazy_nested = lazy;
    }

    /// Opens a top-level transaction, or a nested scope when one is
    /// already open.
    ///
    /// A successful top-level begin opens the performance aggregation
    /// window: statement costs accumulate and dispatch as one aggregate
    /// at commit.
    ///
    /// # Errors
    ///
    /// Returns the classified failure when the engine rejects the
    /// begin.
    pub fn begin_transaction(&mut self) -> CoreResult<()> {
        if self.txn.in_transaction {
            return self.begin_nested_transaction();
        }
        self.hub.begin_aggregation();
        match self.execute_internal("BEGIN IMMEDIATE", StatementKind::BeginTransaction) {
            Ok(()) => {
                self.txn.in_transaction = true;
                Ok(())
            }
            Err(e) => {
                self.hub.discard_aggregation();
                Err(e)
            }
        }
    }

    /// Commits the top-level transaction. Without an open transaction
    /// this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the commit failure. The transaction remains open so the
    /// caller can retry the commit or roll back explicitly; the
    /// aggregation window stays open with it.
    pub fn commit_or_rollback_transaction(&mut self) -> CoreResult<()> {
        self.absorb_step_failure();
        if !self.txn.in_transaction {
            return Ok(());
        }
        self.execute_internal("COMMIT", StatementKind::CommitTransaction)?;
        self.txn.in_transaction = false;
        self.txn.levels.clear();
        self.hub.flush_aggregation(self.tag);
        Ok(())
    }

    /// Rolls the top-level transaction back, discarding the pending
    /// performance aggregate. Without an open transaction this is a
    /// no-op.
    ///
    /// Best-effort: a rollback failure is reported through the error
    /// classifier and the bookkeeping is cleared regardless, because
    /// the engine discards the transaction either way.
    pub fn rollback_transaction(&mut self) {
        if self.txn.in_transaction {
            let _ = self.execute_internal("ROLLBACK", StatementKind::RollbackTransaction);
        }
        self.txn.in_transaction = false;
        self.txn.levels.clear();
        self.hub.discard_aggregation();
    }

    /// Opens a nested scope.
    ///
    /// In lazy mode no SAVEPOINT is issued yet; it materializes when
    /// the first mutating statement executes inside the scope. A scope
    /// that stays read-only never reaches the engine at all.
    ///
    /// # Errors
    ///
    /// Returns the classified failure when an eager SAVEPOINT fails; no
    /// scope is opened in that case.
    pub fn begin_nested_transaction(&mut self) -> CoreResult<()> {
        // A failure that predates the scope belongs to the enclosing one.
        self.absorb_step_failure();
        if !self.txn.lazy_nested {
            let name = savepoint_name(self.txn.levels.len() + 1);
            self.execute_internal(&format!("SAVEPOINT {name}"), StatementKind::Normal)?;
        }
        self.txn.levels.push(NestedLevel {
            materialized: !self.txn.lazy_nested,
            failed: false,
        });
        Ok(())
    }

    /// Closes the innermost nested scope, keeping its effects.
    ///
    /// A scope that saw a statement failure is rewound first, so the
    /// enclosing scope continues from its own state. A release failure
    /// degrades the same way. Without an open scope this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first failure encountered; the scope is closed
    /// either way.
    pub fn commit_or_rollback_nested_transaction(&mut self) -> CoreResult<()> {
        self.absorb_step_failure();
        let Some(level) = self.txn.levels.last().copied() else {
            return Ok(());
        };
        let mut result = Ok(());
        if level.materialized {
            let name = savepoint_name(self.txn.levels.len());
            if level.failed {
                let rewound =
                    self.execute_internal(&format!("ROLLBACK TO {name}"), StatementKind::Normal);
                let released =
                    self.execute_internal(&format!("RELEASE {name}"), StatementKind::Normal);
                result = rewound.and(released);
            } else if let Err(e) =
                self.execute_internal(&format!("RELEASE {name}"), StatementKind::Normal)
            {
                let _ =
                    self.execute_internal(&format!("ROLLBACK TO {name}"), StatementKind::Normal);
                let _ = self.execute_internal(&format!("RELEASE {name}"), StatementKind::Normal);
                result = Err(e);
            }
        }
        self.txn.levels.pop();
        result
    }

    /// Closes the innermost nested scope, discarding its effects. A
    /// scope that never materialized has no effects to discard. Without
    /// an open scope this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first failure encountered; the scope is closed
    /// either way.
    pub fn rollback_nested_transaction(&mut self) -> CoreResult<()> {
        self.absorb_step_failure();
        let Some(level) = self.txn.levels.last().copied() else {
            return Ok(());
        };
        let mut result = Ok(());
        if level.materialized {
            let name = savepoint_name(self.txn.levels.len());
            let rewound =
                self.execute_internal(&format!("ROLLBACK TO {name}"), StatementKind::Normal);
            let released =
                self.execute_internal(&format!("RELEASE {name}"), StatementKind::Normal);
            result = rewound.and(released);
        }
        self.txn.levels.pop();
        result
    }

    /// Issues SAVEPOINTs for every lazily opened scope, outermost
    /// first. Runs just before the first mutating statement executes.
    pub(crate) fn materialize_savepoints(&mut self) -> CoreResult<()> {
        for depth in 0..self.txn.levels.len() {
            if self.txn.levels[depth].materialized {
                continue;
            }
            let name = savepoint_name(depth + 1);
            self.execute_internal(&format!("SAVEPOINT {name}"), StatementKind::Normal)?;
            self.txn.levels[depth].materialized = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn open_connection(path: &Path) -> Connection {
        let mut conn = Connection::new(path);
        conn.open().unwrap();
        conn.exec("CREATE TABLE t (id)").unwrap();
        conn
    }

    fn count_rows(conn: &mut Connection) -> usize {
        let mut stmt = conn.prepare("SELECT * FROM t").unwrap();
        let mut rows = 0;
        while stmt.step().unwrap() {
            rows += 1;
        }
        conn.return_statement(stmt);
        rows
    }

    fn collect_sql(conn: &mut Connection) -> Arc<Mutex<Vec<String>>> {
        let traced = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&traced);
        conn.set_sql_tracer(
            "collect",
            Some(Arc::new(move |sql| sink.lock().push(sql.to_string()))),
        );
        traced
    }

    #[test]
    fn commit_keeps_rows_rollback_discards_them() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));

        conn.begin_transaction().unwrap();
        assert!(conn.is_in_transaction());
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        assert!(!conn.is_in_transaction());
        assert_eq!(count_rows(&mut conn), 1);

        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        conn.rollback_transaction();
        assert_eq!(count_rows(&mut conn), 1);
        conn.close().unwrap();
    }

    #[test]
    fn committed_insert_updates_derived_accessors() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        assert_eq!(conn.changes(), 1);
        assert_eq!(conn.last_inserted_row_id(), 1);
        conn.close().unwrap();
    }

    #[test]
    fn failed_commit_leaves_the_transaction_open_for_retry() {
        use quarrydb_engine::{MemoryEngine, Status};

        let dir = tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut conn = Connection::with_engine(dir.path().join("store.qdb"), engine.clone());
        conn.open().unwrap();
        conn.exec("CREATE TABLE t (id)").unwrap();

        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        engine.inject_busy(1);
        let err = conn.commit_or_rollback_transaction().unwrap_err();
        assert_eq!(err.code(), Some(Status::BUSY));
        assert!(conn.is_in_transaction());

        // The retry commits everything the first attempt could not.
        conn.commit_or_rollback_transaction().unwrap();
        assert!(!conn.is_in_transaction());
        assert_eq!(count_rows(&mut conn), 1);
        conn.close().unwrap();
    }

    #[test]
    fn unmatched_commit_and_rollback_are_no_ops() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.commit_or_rollback_transaction().unwrap();
        conn.rollback_transaction();
        conn.commit_or_rollback_nested_transaction().unwrap();
        conn.rollback_nested_transaction().unwrap();
        assert!(!conn.is_in_transaction());
        assert_eq!(conn.nested_transaction_level(), 0);
        conn.close().unwrap();
    }

    #[test]
    fn begin_inside_a_transaction_opens_a_nested_scope() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.begin_transaction().unwrap();
        assert_eq!(conn.nested_transaction_level(), 1);
        conn.commit_or_rollback_nested_transaction().unwrap();
        assert_eq!(conn.nested_transaction_level(), 0);
        conn.commit_or_rollback_transaction().unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn nested_levels_balance() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        assert_eq!(conn.nested_transaction_level(), 2);
        conn.commit_or_rollback_nested_transaction().unwrap();
        assert_eq!(conn.nested_transaction_level(), 1);
        conn.rollback_nested_transaction().unwrap();
        assert_eq!(conn.nested_transaction_level(), 0);
        conn.commit_or_rollback_transaction().unwrap();
        conn.close().unwrap();
    }

    #[test]
    fn nested_rollback_discards_only_the_inner_scope() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        conn.rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        assert_eq!(count_rows(&mut conn), 1);
        conn.close().unwrap();
    }

    #[test]
    fn lazy_scope_issues_no_sql_when_read_only() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.set_lazy_nested_transaction(true);

        let traced = collect_sql(&mut conn);
        conn.begin_nested_transaction().unwrap();
        assert_eq!(count_rows(&mut conn), 1);
        conn.commit_or_rollback_nested_transaction().unwrap();
        assert_eq!(*traced.lock(), vec!["SELECT * FROM t"]);
        conn.close().unwrap();
    }

    #[test]
    fn lazy_scope_materializes_on_first_write() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.set_lazy_nested_transaction(true);

        conn.begin_transaction().unwrap();
        let traced = collect_sql(&mut conn);
        conn.begin_nested_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        assert_eq!(
            *traced.lock(),
            vec![
                "INSERT INTO t VALUES (1)",
                "SAVEPOINT quarrydb_savepoint_1",
                "SAVEPOINT quarrydb_savepoint_2",
            ]
        );

        // Rolling the inner scope back discards the insert but keeps
        // the outer scope's view intact.
        conn.rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        assert_eq!(count_rows(&mut conn), 0);
        conn.close().unwrap();
    }

    #[test]
    fn failed_scope_is_rewound_before_release() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        let _ = conn.exec("INSERT INTO missing VALUES (1)").unwrap_err();
        conn.commit_or_rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        // The scope saw a failure, so its insert was rewound.
        assert_eq!(count_rows(&mut conn), 0);
        conn.close().unwrap();
    }

    #[test]
    fn one_performance_aggregate_per_committed_transaction() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.set_tag(Some(42));
        let aggregates: Arc<Mutex<Vec<(Option<i64>, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&aggregates);
        conn.set_performance_tracer(
            "test",
            Some(Arc::new(move |tag, footprints, _cost: Duration| {
                sink.lock().push((tag, footprints.values().sum()));
            })),
        );

        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        // BEGIN, two inserts, COMMIT: one aggregate of four statements.
        assert_eq!(*aggregates.lock(), vec![(Some(42), 4)]);

        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (3)").unwrap();
        conn.rollback_transaction();
        assert_eq!(aggregates.lock().len(), 1);
        conn.close().unwrap();
    }

    #[test]
    fn standalone_statement_gets_its_own_aggregate() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        let aggregates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&aggregates);
        conn.set_performance_tracer(
            "test",
            Some(Arc::new(move |_tag, footprints, _cost| {
                sink.lock()
                    .push(footprints.keys().cloned().collect::<Vec<_>>());
            })),
        );

        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        let entries = aggregates.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], vec!["INSERT INTO t VALUES (1)"]);
        drop(entries);
        conn.close().unwrap();
    }

    #[test]
    fn close_mid_transaction_discards_uncommitted_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.qdb");
        let mut conn = open_connection(&path);
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (2)").unwrap();
        conn.close().unwrap();
        assert!(!conn.is_in_transaction());

        let mut conn = Connection::new(&path);
        conn.open().unwrap();
        assert_eq!(count_rows(&mut conn), 1);
        conn.close().unwrap();
    }

    #[test]
    fn failed_borrowed_step_rewinds_the_scope() {
        use quarrydb_engine::Status;

        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();

        let mut stmt = conn.prepare("INSERT INTO t VALUES (2)").unwrap();
        conn.interrupt();
        let err = stmt.step().unwrap_err();
        assert_eq!(err.code(), Some(Status::INTERRUPT));
        conn.return_statement(stmt);

        conn.commit_or_rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        // The scope saw the step failure, so its insert was rewound.
        assert_eq!(count_rows(&mut conn), 0);
        conn.close().unwrap();
    }

    #[test]
    fn failed_borrowed_prepare_rewinds_the_scope() {
        let dir = tempdir().unwrap();
        let mut conn = open_connection(&dir.path().join("store.qdb"));
        conn.begin_transaction().unwrap();
        conn.begin_nested_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        let _ = conn.prepare("SELECT * FROM missing").map(|_| ()).unwrap_err();

        conn.commit_or_rollback_nested_transaction().unwrap();
        conn.commit_or_rollback_transaction().unwrap();
        assert_eq!(count_rows(&mut conn), 0);
        conn.close().unwrap();
    }

    #[test]
    fn rolled_back_rows_do_not_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.qdb");
        let mut conn = open_connection(&path);
        conn.begin_transaction().unwrap();
        conn.exec("INSERT INTO t VALUES (1)").unwrap();
        // Dropping without commit discards the open transaction.
        conn.rollback_transaction();
        conn.close().unwrap();

        let mut conn = Connection::new(&path);
        conn.open().unwrap();
        assert_eq!(count_rows(&mut conn), 0);
        conn.close().unwrap();
    }
}
