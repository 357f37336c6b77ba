//! Raw status codes and the native error type.

use thiserror::Error;

/// Result type for native engine calls.
pub type NativeResult<T> = Result<T, NativeError>;

/// A raw numeric status code reported by the native engine.
///
/// The numbering follows the SQLite convention so that callers probing
/// for well-known conditions (contention, corruption, constraint
/// violations) can match on stable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(pub i32);

impl Status {
    /// Successful result.
    pub const OK: Status = Status(0);
    /// Generic error.
    pub const ERROR: Status = Status(1);
    /// The store is locked by another user.
    pub const BUSY: Status = Status(5);
    /// An attempt was made to write a read-only store.
    pub const READONLY: Status = Status(8);
    /// The operation was interrupted.
    pub const INTERRUPT: Status = Status(9);
    /// A low-level I/O error occurred.
    pub const IOERR: Status = Status(10);
    /// The store file is malformed.
    pub const CORRUPT: Status = Status(11);
    /// The store file could not be opened.
    pub const CANTOPEN: Status = Status(14);
    /// A constraint violation occurred.
    pub const CONSTRAINT: Status = Status(19);
    /// The call surface was used incorrectly.
    pub const MISUSE: Status = Status(21);
    /// The file is encrypted or is not a database.
    pub const NOTADB: Status = Status(26);
    /// A row of data is available.
    pub const ROW: Status = Status(100);
    /// Execution finished with no more rows.
    pub const DONE: Status = Status(101);

    /// Whether this code means "not an error": success, a row being
    /// available, or execution having finished.
    #[must_use]
    pub const fn is_succeeded(self) -> bool {
        matches!(self, Status::OK | Status::ROW | Status::DONE)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An error reported by a native engine call.
#[derive(Debug, Clone, Error)]
#[error("native error {status}: {message}")]
pub struct NativeError {
    /// Primary status code.
    pub status: Status,
    /// Extended status code, when the engine distinguishes one.
    pub extended: i32,
    /// Message text from the engine.
    pub message: String,
}

impl NativeError {
    /// Creates an error with identical primary and extended codes.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            extended: status.raw(),
            message: message.into(),
        }
    }

    /// Creates an error with a distinct extended code.
    pub fn with_extended(status: Status, extended: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            extended,
            message: message.into(),
        }
    }

    /// Creates a `BUSY` contention error.
    pub fn busy() -> Self {
        Self::new(Status::BUSY, "database is locked")
    }

    /// Creates an `INTERRUPT` error.
    pub fn interrupted() -> Self {
        Self::new(Status::INTERRUPT, "interrupted")
    }

    /// Creates a `CORRUPT` error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(Status::CORRUPT, message)
    }

    /// Creates a `NOTADB` error.
    pub fn not_a_database() -> Self {
        Self::new(Status::NOTADB, "file is not a database")
    }
}

impl From<std::io::Error> for NativeError {
    fn from(e: std::io::Error) -> Self {
        Self::new(Status::IOERR, format!("disk I/O error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeded_codes() {
        assert!(Status::OK.is_succeeded());
        assert!(Status::ROW.is_succeeded());
        assert!(Status::DONE.is_succeeded());
        assert!(!Status::BUSY.is_succeeded());
        assert!(!Status::ERROR.is_succeeded());
    }

    #[test]
    fn extended_defaults_to_primary() {
        let e = NativeError::new(Status::BUSY, "locked");
        assert_eq!(e.extended, Status::BUSY.raw());
    }
}
