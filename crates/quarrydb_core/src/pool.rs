//! Per-connection pool of statement slots.

use crate::statement::HandleStatement;

/// Recycles statement slots so hot paths skip the allocation.
///
/// Returned slots keep their compiled statement alive in reset state;
/// it is replaced by the next `prepare` and torn down in bulk before
/// the connection closes.
pub(crate) struct StatementPool {
    idle: Vec<HandleStatement>,
}

impl StatementPool {
    pub(crate) fn new() -> Self {
        Self { idle: Vec::new() }
    }

    /// Borrows a slot, reusing an idle one when available.
    pub(crate) fn get_statement(&mut self) -> HandleStatement {
        self.idle.pop().unwrap_or_else(HandleStatement::empty)
    }

    /// Returns a slot to the pool in reset state.
    pub(crate) fn return_statement(&mut self, mut stmt: HandleStatement) {
        stmt.reset();
        self.idle.push(stmt);
    }

    /// Finalizes every pooled statement. Must run before the handle
    /// that compiled them closes.
    pub(crate) fn finalize_all(&mut self) {
        for stmt in &mut self.idle {
            stmt.finalize();
        }
        self.idle.clear();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.len()
    }
}
