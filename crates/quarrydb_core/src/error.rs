//! Error taxonomy for the connection core.
//!
//! Every native failure surfaces as an [`ErrorRecord`] wrapped in a
//! [`CoreError`] variant naming the operation that failed. Records carry
//! the connection tag and path so a log line is attributable without
//! extra context.

use quarrydb_engine::{NativeError, Status};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type used throughout the connection core.
pub type CoreResult<T> = Result<T, CoreError>;

/// The connection-core operation during which an error arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Opening the underlying handle.
    Open,
    /// Closing the underlying handle.
    Close,
    /// Compiling a statement.
    Prepare,
    /// Stepping a statement to completion.
    Exec,
    /// Supplying a cipher key.
    SetCipherKey,
    /// Serializing master info for a backup.
    SaveMaster,
    /// Salvaging a corrupted store.
    Repair,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Open => "open",
            Operation::Close => "close",
            Operation::Prepare => "prepare",
            Operation::Exec => "exec",
            Operation::SetCipherKey => "set-cipher-key",
            Operation::SaveMaster => "save-master",
            Operation::Repair => "repair",
        };
        f.write_str(name)
    }
}

/// How an error was classified when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Reported to the error observer.
    Reported,
    /// Suppressed by the ignorable-code stack; never observed.
    Ignored,
}

/// One fully-attributed native failure.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// Tag of the connection the error arose on, when one was set.
    pub tag: Option<i64>,
    /// Store path the connection targets.
    pub path: PathBuf,
    /// Operation that failed.
    pub operation: Operation,
    /// SQL text in flight, when the operation carried one.
    pub sql: Option<String>,
    /// Primary status code.
    pub code: Status,
    /// Extended status code.
    pub extended_code: i32,
    /// Message text from the engine.
    pub message: String,
    /// Classification applied when the error was recorded.
    pub severity: Severity,
}

impl ErrorRecord {
    pub(crate) fn new(
        operation: Operation,
        path: &Path,
        tag: Option<i64>,
        sql: Option<&str>,
        native: NativeError,
        severity: Severity,
    ) -> Self {
        Self {
            tag,
            path: path.to_path_buf(),
            operation,
            sql: sql.map(str::to_string),
            code: native.status,
            extended_code: native.extended,
            message: native.message,
            severity,
        }
    }
}

/// Errors produced by the connection core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The handle could not be opened.
    #[error("failed to open {}: {}", .0.path.display(), .0.message)]
    OpenFailure(ErrorRecord),

    /// The handle could not be closed cleanly.
    #[error("failed to close {}: {}", .0.path.display(), .0.message)]
    CloseFailure(ErrorRecord),

    /// A statement could not be compiled.
    #[error("failed to prepare statement on {}: {}", .0.path.display(), .0.message)]
    PrepareFailure(ErrorRecord),

    /// A statement failed while executing.
    #[error("statement failed on {}: {}", .0.path.display(), .0.message)]
    ExecFailure(ErrorRecord),

    /// The engine rejected a cipher key.
    #[error("cipher key rejected for {}: {}", .0.path.display(), .0.message)]
    CipherFailure(ErrorRecord),

    /// Master info could not be saved.
    #[error("backup of {} failed: {}", .0.path.display(), .0.message)]
    BackupFailure(ErrorRecord),

    /// A corrupted store could not be salvaged.
    #[error("recovery of {} failed: {}", .0.path.display(), .0.message)]
    RecoverFailure(ErrorRecord),

    /// An I/O error outside any engine call.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The attributed record, when this error carries one.
    #[must_use]
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            CoreError::OpenFailure(r)
            | CoreError::CloseFailure(r)
            | CoreError::PrepareFailure(r)
            | CoreError::ExecFailure(r)
            | CoreError::CipherFailure(r)
            | CoreError::BackupFailure(r)
            | CoreError::RecoverFailure(r) => Some(r),
            CoreError::Io(_) => None,
        }
    }

    /// The primary status code, when this error carries one.
    #[must_use]
    pub fn code(&self) -> Option<Status> {
        self.record().map(|r| r.code)
    }

    /// Whether the error was suppressed by the ignorable-code stack.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(
            self.record().map(|r| r.severity),
            Some(Severity::Ignored)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(severity: Severity) -> ErrorRecord {
        ErrorRecord::new(
            Operation::Exec,
            Path::new("/tmp/store.qdb"),
            Some(7),
            Some("DELETE FROM t"),
            NativeError::busy(),
            severity,
        )
    }

    #[test]
    fn record_carries_attribution() {
        let record = sample_record(Severity::Reported);
        assert_eq!(record.tag, Some(7));
        assert_eq!(record.code, Status::BUSY);
        assert_eq!(record.sql.as_deref(), Some("DELETE FROM t"));
    }

    #[test]
    fn ignored_classification_is_queryable() {
        let err = CoreError::ExecFailure(sample_record(Severity::Ignored));
        assert!(err.is_ignored());
        assert_eq!(err.code(), Some(Status::BUSY));

        let err = CoreError::ExecFailure(sample_record(Severity::Reported));
        assert!(!err.is_ignored());
    }

    #[test]
    fn io_errors_carry_no_record() {
        let err = CoreError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(err.record().is_none());
        assert!(!err.is_ignored());
    }
}
