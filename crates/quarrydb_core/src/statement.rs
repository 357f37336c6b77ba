//! Statement classification and the reusable statement wrapper.

use crate::classifier::ErrorClassifier;
use crate::error::{CoreError, CoreResult, ErrorRecord, Operation, Severity};
use quarrydb_engine::{NativeError, NativeHandle, NativeResult, NativeStatement, Status};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a statement interacts with transaction ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// An ordinary statement.
    Normal,
    /// Opens a top-level transaction.
    BeginTransaction,
    /// Commits a top-level transaction.
    CommitTransaction,
    /// Rolls a top-level transaction back.
    RollbackTransaction,
}

impl StatementKind {
    /// Classifies `sql` by its leading keyword.
    ///
    /// `ROLLBACK TO savepoint` is an ordinary statement: it rewinds a
    /// savepoint without ending the enclosing transaction. `SAVEPOINT`
    /// and `RELEASE` are ordinary for the same reason.
    #[must_use]
    pub fn classify(sql: &str) -> StatementKind {
        let mut words = sql.split_whitespace();
        let Some(first) = words.next() else {
            return StatementKind::Normal;
        };
        if first.eq_ignore_ascii_case("BEGIN") {
            StatementKind::BeginTransaction
        } else if first.eq_ignore_ascii_case("COMMIT") || first.eq_ignore_ascii_case("END") {
            StatementKind::CommitTransaction
        } else if first.eq_ignore_ascii_case("ROLLBACK") {
            match words.next() {
                Some(word) if word.eq_ignore_ascii_case("TO") => StatementKind::Normal,
                _ => StatementKind::RollbackTransaction,
            }
        } else {
            StatementKind::Normal
        }
    }
}

/// Attribution the owning connection hands to a compiled statement, so a
/// failure on a borrowed statement is classified and reported the same
/// way an `exec` failure is. The shared flag carries the failure back to
/// the connection's transaction bookkeeping at the next scope boundary.
pub(crate) struct StatementContext {
    pub(crate) classifier: Arc<ErrorClassifier>,
    pub(crate) tag: Option<i64>,
    pub(crate) path: PathBuf,
    pub(crate) failure: Arc<AtomicBool>,
}

/// A compiled statement slot owned by one connection's pool.
///
/// A slot outlives the statements compiled into it: returning it to the
/// pool resets the compiled statement rather than finalizing it, and the
/// next `prepare` replaces it.
pub struct HandleStatement {
    stmt: Option<Box<dyn NativeStatement>>,
    sql: String,
    kind: StatementKind,
    context: Option<StatementContext>,
}

impl HandleStatement {
    pub(crate) fn empty() -> Self {
        Self {
            stmt: None,
            sql: String::new(),
            kind: StatementKind::Normal,
            context: None,
        }
    }

    pub(crate) fn attach_context(&mut self, context: StatementContext) {
        self.context = Some(context);
    }

    /// Compiles `sql` into this slot, replacing any prior statement.
    ///
    /// # Errors
    ///
    /// Returns the engine's compilation error; the slot is left empty.
    pub fn prepare(&mut self, handle: &mut dyn NativeHandle, sql: &str) -> NativeResult<()> {
        self.stmt = None;
        let stmt = handle.prepare(sql)?;
        self.sql = sql.to_string();
        self.kind = StatementKind::classify(sql);
        self.stmt = Some(stmt);
        Ok(())
    }

    /// Advances execution by one row-step.
    ///
    /// A failure is classified and reported through the owning
    /// connection's error machinery, and recorded against the innermost
    /// open nested scope so it is rewound rather than released.
    ///
    /// # Errors
    ///
    /// Returns `MISUSE` when nothing is compiled, otherwise the engine's
    /// execution error classified into [`CoreError::ExecFailure`].
    pub fn step(&mut self) -> CoreResult<bool> {
        let Some(stmt) = self.stmt.as_mut() else {
            return Err(self.exec_failure(NativeError::new(
                Status::MISUSE,
                "statement is not prepared",
            )));
        };
        match stmt.step() {
            Ok(has_row) => Ok(has_row),
            Err(e) => Err(self.exec_failure(e)),
        }
    }

    fn exec_failure(&self, native: NativeError) -> CoreError {
        let sql = if self.sql.is_empty() {
            None
        } else {
            Some(self.sql.as_str())
        };
        match &self.context {
            Some(ctx) => {
                let severity = ctx.classifier.classify(&native);
                let record =
                    ErrorRecord::new(Operation::Exec, &ctx.path, ctx.tag, sql, native, severity);
                ctx.classifier.report(&record);
                if record.severity != Severity::Ignored {
                    ctx.failure.store(true, Ordering::SeqCst);
                }
                CoreError::ExecFailure(record)
            }
            None => CoreError::ExecFailure(ErrorRecord::new(
                Operation::Exec,
                Path::new(""),
                None,
                sql,
                native,
                Severity::Reported,
            )),
        }
    }

    /// Rewinds the compiled statement, if any.
    pub fn reset(&mut self) {
        if let Some(stmt) = self.stmt.as_mut() {
            stmt.reset();
        }
    }

    /// Whether the compiled statement cannot mutate the store.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.stmt.as_ref().map_or(true, |s| s.readonly())
    }

    /// Whether a statement is currently compiled into this slot.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.stmt.is_some()
    }

    /// SQL text of the compiled statement.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Transaction classification of the compiled statement.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// Number of columns in the current row.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.stmt.as_ref().map_or(0, |s| s.column_count())
    }

    /// Integer value of column `index` in the current row.
    #[must_use]
    pub fn column_int(&self, index: usize) -> i64 {
        self.stmt.as_ref().map_or(0, |s| s.column_int(index))
    }

    /// Text value of column `index` in the current row.
    #[must_use]
    pub fn column_text(&self, index: usize) -> String {
        self.stmt
            .as_ref()
            .map_or_else(String::new, |s| s.column_text(index))
    }

    pub(crate) fn finalize(&mut self) {
        self.stmt = None;
        self.sql.clear();
        self.kind = StatementKind::Normal;
        self.context = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transaction_keywords() {
        assert_eq!(
            StatementKind::classify("BEGIN IMMEDIATE"),
            StatementKind::BeginTransaction
        );
        assert_eq!(
            StatementKind::classify("commit"),
            StatementKind::CommitTransaction
        );
        assert_eq!(
            StatementKind::classify("END TRANSACTION"),
            StatementKind::CommitTransaction
        );
        assert_eq!(
            StatementKind::classify("ROLLBACK"),
            StatementKind::RollbackTransaction
        );
    }

    #[test]
    fn rollback_to_savepoint_is_normal() {
        assert_eq!(
            StatementKind::classify("ROLLBACK TO sp_1"),
            StatementKind::Normal
        );
        assert_eq!(
            StatementKind::classify("rollback to sp_1"),
            StatementKind::Normal
        );
    }

    #[test]
    fn savepoint_statements_are_normal() {
        assert_eq!(
            StatementKind::classify("SAVEPOINT sp_1"),
            StatementKind::Normal
        );
        assert_eq!(
            StatementKind::classify("RELEASE sp_1"),
            StatementKind::Normal
        );
    }

    #[test]
    fn empty_and_ordinary_sql_are_normal() {
        assert_eq!(StatementKind::classify(""), StatementKind::Normal);
        assert_eq!(
            StatementKind::classify("SELECT * FROM t"),
            StatementKind::Normal
        );
    }

    #[test]
    fn stepping_an_unprepared_slot_is_misuse() {
        let mut slot = HandleStatement::empty();
        let err = slot.step().unwrap_err();
        assert_eq!(err.code(), Some(Status::MISUSE));
        assert!(slot.is_readonly());
        assert_eq!(slot.column_count(), 0);
    }
}
