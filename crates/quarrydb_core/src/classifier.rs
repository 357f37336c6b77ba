//! Ignorable-code stack and error reporting.
//!
//! Callers that are about to probe for an expected failure (a missing
//! table, a lock they intend to retry around) push the status code they
//! expect; while the code sits on top of the stack, matching failures
//! are classified [`Severity::Ignored`] and never reach the observer.
//! The stack is scoped: [`IgnorableGuard`] pops on drop, so early
//! returns cannot leave a stale entry behind.

use crate::error::{ErrorRecord, Severity};
use parking_lot::Mutex;
use quarrydb_engine::{NativeError, Status};
use std::sync::Arc;

/// Receives every reported (non-ignored) error record.
pub type ErrorObserver = Arc<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Classifies native failures and routes reported ones to an observer.
///
/// One classifier belongs to one connection; statements, transactions
/// and recovery on that connection all report through it.
pub struct ErrorClassifier {
    ignorable: Mutex<Vec<Status>>,
    observer: Mutex<Option<ErrorObserver>>,
}

impl ErrorClassifier {
    pub(crate) fn new() -> Self {
        Self {
            ignorable: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    /// Installs or clears the observer. Without one, reported errors go
    /// to the log.
    pub fn set_observer(&self, observer: Option<ErrorObserver>) {
        *self.observer.lock() = observer;
    }

    /// Pushes `code` onto the ignorable stack.
    ///
    /// Prefer [`ErrorClassifier::ignore_code`]; an unmatched push
    /// silences every later failure with this code until the matching
    /// [`ErrorClassifier::mark_error_as_unignorable`] runs.
    pub fn mark_error_as_ignorable(&self, code: Status) {
        self.ignorable.lock().push(code);
    }

    /// Pops the most recent ignorable entry. No-op on an empty stack.
    pub fn mark_error_as_unignorable(&self) {
        self.ignorable.lock().pop();
    }

    /// Pushes `code` and returns a guard that pops it on drop.
    #[must_use]
    pub fn ignore_code(self: &Arc<Self>, code: Status) -> IgnorableGuard {
        self.mark_error_as_ignorable(code);
        IgnorableGuard {
            classifier: Arc::clone(self),
        }
    }

    /// Classifies a native failure against the top of the stack.
    pub fn classify(&self, native: &NativeError) -> Severity {
        if self.ignorable.lock().last() == Some(&native.status) {
            Severity::Ignored
        } else {
            Severity::Reported
        }
    }

    /// Routes a record to the observer. Ignored records are dropped.
    pub fn report(&self, record: &ErrorRecord) {
        if record.severity == Severity::Ignored {
            return;
        }
        if let Some(observer) = self.observer.lock().as_ref() {
            observer(record);
            return;
        }
        tracing::error!(
            code = record.code.raw(),
            extended = record.extended_code,
            operation = %record.operation,
            path = %record.path.display(),
            sql = record.sql.as_deref().unwrap_or(""),
            "{}",
            record.message
        );
    }
}

/// Pops one ignorable entry when dropped.
pub struct IgnorableGuard {
    classifier: Arc<ErrorClassifier>,
}

impl Drop for IgnorableGuard {
    fn drop(&mut self) {
        self.classifier.mark_error_as_unignorable();
    }
}
