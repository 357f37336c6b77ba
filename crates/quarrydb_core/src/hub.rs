//! Notification registries for one connection.
//!
//! The hub owns every callback a connection can fire: SQL trace,
//! performance trace, committed / checkpointed / busy notifications, and
//! the will-step / did-step pair. Registries are name-keyed so callers
//! can replace or remove a callback without touching the others.
//!
//! The hub's shared state is materialized lazily on the first
//! registration; a connection that never registers anything pays one
//! `Option` check per dispatch site. Engine-facing hook closures capture
//! the state through a [`Weak`], so a hook the engine fires after the
//! hub is gone degrades to a no-op instead of keeping the registries
//! alive.

use crate::statement::StatementKind;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Observes every SQL string handed to the engine.
pub type SqlTracer = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives a performance aggregate: connection tag, per-SQL execution
/// counts, and total wall-clock cost.
pub type PerformanceTracer =
    Arc<dyn Fn(Option<i64>, &HashMap<String, u32>, Duration) + Send + Sync>;

/// Fired after a write-ahead-log commit with the store path and the
/// number of pages written.
pub type CommittedNotification = Arc<dyn Fn(&Path, u32) + Send + Sync>;

/// Fired after the write-ahead log is folded into the main store.
pub type CheckpointedNotification = Arc<dyn Fn(&Path) + Send + Sync>;

/// Consulted on contention with the store path and attempt count;
/// returning `true` retries the blocked operation.
pub type BusyNotification = Arc<dyn Fn(&Path, i32) -> bool + Send + Sync>;

/// Fired before each statement step with the store path and SQL text.
pub type WillStepNotification = Arc<dyn Fn(&Path, &str) + Send + Sync>;

/// Fired after each successful statement step; the flag is `true` when
/// the step produced a row.
pub type DidStepNotification = Arc<dyn Fn(&Path, &str, bool) + Send + Sync>;

/// Execution counts and total cost accumulated over one transaction.
#[derive(Default)]
struct PerformanceAggregate {
    footprints: HashMap<String, u32>,
    cost: Duration,
}

/// Committed notifications dispatch in ascending priority; entries with
/// equal priority dispatch in registration order. Re-registering a name
/// keeps its slot semantics simple: the old entry is removed first.
#[derive(Default)]
struct CommittedRegistry {
    entries: BTreeMap<(i32, u64), (String, CommittedNotification)>,
    by_name: HashMap<String, (i32, u64)>,
    next_seq: u64,
}

impl CommittedRegistry {
    fn set(&mut self, priority: i32, name: &str, callback: CommittedNotification) {
        self.unset(name);
        let key = (priority, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, (name.to_string(), callback));
        self.by_name.insert(name.to_string(), key);
    }

    fn unset(&mut self, name: &str) {
        if let Some(key) = self.by_name.remove(name) {
            self.entries.remove(&key);
        }
    }
}

#[derive(Default)]
pub(crate) struct HubState {
    sql: Mutex<HashMap<String, SqlTracer>>,
    performance: Mutex<HashMap<String, PerformanceTracer>>,
    committed: Mutex<CommittedRegistry>,
    checkpointed: Mutex<HashMap<String, CheckpointedNotification>>,
    busy: Mutex<HashMap<String, BusyNotification>>,
    will_step: Mutex<HashMap<String, WillStepNotification>>,
    did_step: Mutex<HashMap<String, DidStepNotification>>,
    aggregate: Mutex<Option<PerformanceAggregate>>,
}

impl HubState {
    pub(crate) fn dispatch_committed(&self, path: &Path, pages: u32) {
        let callbacks: Vec<CommittedNotification> = self
            .committed
            .lock()
            .entries
            .values()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(path, pages);
        }
    }

    pub(crate) fn dispatch_checkpointed(&self, path: &Path) {
        let callbacks: Vec<CheckpointedNotification> =
            self.checkpointed.lock().values().cloned().collect();
        for callback in callbacks {
            callback(path);
        }
    }

    /// Returns `true` when any registered notification votes to retry.
    pub(crate) fn dispatch_busy(&self, path: &Path, attempts: i32) -> bool {
        let callbacks: Vec<BusyNotification> = self.busy.lock().values().cloned().collect();
        let mut retry = false;
        for callback in callbacks {
            if callback(path, attempts) {
                retry = true;
            }
        }
        retry
    }

    fn dispatch_performance(&self, tag: Option<i64>, aggregate: &PerformanceAggregate) {
        let callbacks: Vec<PerformanceTracer> =
            self.performance.lock().values().cloned().collect();
        for callback in callbacks {
            callback(tag, &aggregate.footprints, aggregate.cost);
        }
    }
}

/// The per-connection notification hub.
pub(crate) struct InstrumentationHub {
    state: Option<Arc<HubState>>,
}

impl InstrumentationHub {
    pub(crate) fn new() -> Self {
        Self { state: None }
    }

    fn state(&mut self) -> &Arc<HubState> {
        self.state.get_or_insert_with(|| Arc::new(HubState::default()))
    }

    /// A weak reference for engine-facing hook closures, when the hub
    /// has been materialized.
    pub(crate) fn state_weak(&self) -> Option<Weak<HubState>> {
        self.state.as_ref().map(Arc::downgrade)
    }

    pub(crate) fn set_sql_tracer(&mut self, name: &str, tracer: Option<SqlTracer>) {
        match tracer {
            Some(tracer) => {
                self.state().sql.lock().insert(name.to_string(), tracer);
            }
            None => {
                if let Some(state) = &self.state {
                    state.sql.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn set_performance_tracer(
        &mut self,
        name: &str,
        tracer: Option<PerformanceTracer>,
    ) {
        match tracer {
            Some(tracer) => {
                self.state()
                    .performance
                    .lock()
                    .insert(name.to_string(), tracer);
            }
            None => {
                if let Some(state) = &self.state {
                    state.performance.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn set_committed_notification(
        &mut self,
        priority: i32,
        name: &str,
        callback: CommittedNotification,
    ) {
        self.state().committed.lock().set(priority, name, callback);
    }

    pub(crate) fn unset_committed_notification(&mut self, name: &str) {
        if let Some(state) = &self.state {
            state.committed.lock().unset(name);
        }
    }

    pub(crate) fn set_checkpointed_notification(
        &mut self,
        name: &str,
        callback: Option<CheckpointedNotification>,
    ) {
        match callback {
            Some(callback) => {
                self.state()
                    .checkpointed
                    .lock()
                    .insert(name.to_string(), callback);
            }
            None => {
                if let Some(state) = &self.state {
                    state.checkpointed.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn set_busy_notification(
        &mut self,
        name: &str,
        callback: Option<BusyNotification>,
    ) {
        match callback {
            Some(callback) => {
                self.state().busy.lock().insert(name.to_string(), callback);
            }
            None => {
                if let Some(state) = &self.state {
                    state.busy.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn set_will_step_notification(
        &mut self,
        name: &str,
        callback: Option<WillStepNotification>,
    ) {
        match callback {
            Some(callback) => {
                self.state()
                    .will_step
                    .lock()
                    .insert(name.to_string(), callback);
            }
            None => {
                if let Some(state) = &self.state {
                    state.will_step.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn set_did_step_notification(
        &mut self,
        name: &str,
        callback: Option<DidStepNotification>,
    ) {
        match callback {
            Some(callback) => {
                self.state()
                    .did_step
                    .lock()
                    .insert(name.to_string(), callback);
            }
            None => {
                if let Some(state) = &self.state {
                    state.did_step.lock().remove(name);
                }
            }
        }
    }

    pub(crate) fn has_committed(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| !s.committed.lock().entries.is_empty())
    }

    pub(crate) fn has_checkpointed(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| !s.checkpointed.lock().is_empty())
    }

    pub(crate) fn has_busy(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| !s.busy.lock().is_empty())
    }

    pub(crate) fn has_performance(&self) -> bool {
        self.state
            .as_ref()
            .map_or(false, |s| !s.performance.lock().is_empty())
    }

    pub(crate) fn trace_sql(&self, sql: &str) {
        let Some(state) = &self.state else { return };
        let tracers: Vec<SqlTracer> = state.sql.lock().values().cloned().collect();
        for tracer in tracers {
            tracer(sql);
        }
    }

    pub(crate) fn will_step(&self, path: &Path, sql: &str) {
        let Some(state) = &self.state else { return };
        let callbacks: Vec<WillStepNotification> =
            state.will_step.lock().values().cloned().collect();
        for callback in callbacks {
            callback(path, sql);
        }
    }

    pub(crate) fn did_step(&self, path: &Path, sql: &str, has_row: bool) {
        let Some(state) = &self.state else { return };
        let callbacks: Vec<DidStepNotification> =
            state.did_step.lock().values().cloned().collect();
        for callback in callbacks {
            callback(path, sql, has_row);
        }
    }

    /// Opens a performance aggregation window for a transaction.
    pub(crate) fn begin_aggregation(&mut self) {
        if !self.has_performance() {
            return;
        }
        *self.state().aggregate.lock() = Some(PerformanceAggregate::default());
    }

    /// Records one statement's cost.
    ///
    /// Inside an aggregation window the cost accumulates. Outside one,
    /// an ordinary statement flushes immediately as its own aggregate;
    /// transaction-control statements never flush standalone, their
    /// cost belongs to the window they open or close.
    ///
    /// Windows open only at BEGIN, so a tracer registered while a
    /// transaction is already running receives per-statement aggregates
    /// until the next BEGIN.
    pub(crate) fn record_cost(
        &self,
        tag: Option<i64>,
        sql: &str,
        cost: Duration,
        kind: StatementKind,
    ) {
        let Some(state) = &self.state else { return };
        {
            let mut aggregate = state.aggregate.lock();
            if let Some(aggregate) = aggregate.as_mut() {
                *aggregate.footprints.entry(sql.to_string()).or_insert(0) += 1;
                aggregate.cost += cost;
                return;
            }
        }
        if kind != StatementKind::Normal || state.performance.lock().is_empty() {
            return;
        }
        let mut single = PerformanceAggregate::default();
        single.footprints.insert(sql.to_string(), 1);
        single.cost = cost;
        state.dispatch_performance(tag, &single);
    }

    /// Closes the aggregation window and dispatches its contents.
    pub(crate) fn flush_aggregation(&self, tag: Option<i64>) {
        let Some(state) = &self.state else { return };
        let taken = state.aggregate.lock().take();
        if let Some(aggregate) = taken {
            state.dispatch_performance(tag, &aggregate);
        }
    }

    /// Closes the aggregation window without dispatching.
    pub(crate) fn discard_aggregation(&self) {
        if let Some(state) = &self.state {
            state.aggregate.lock().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn recording_committed(
        log: &Arc<PlMutex<Vec<String>>>,
        label: &str,
    ) -> CommittedNotification {
        let log = Arc::clone(log);
        let label = label.to_string();
        Arc::new(move |_path, _pages| log.lock().push(label.clone()))
    }

    #[test]
    fn committed_dispatch_orders_by_priority_then_registration() {
        let mut hub = InstrumentationHub::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        hub.set_committed_notification(10, "late", recording_committed(&log, "late"));
        hub.set_committed_notification(-5, "early", recording_committed(&log, "early"));
        hub.set_committed_notification(10, "late-second", recording_committed(&log, "late2"));
        hub.set_committed_notification(0, "middle", recording_committed(&log, "middle"));

        let state = hub.state_weak().unwrap().upgrade().unwrap();
        state.dispatch_committed(Path::new("a.qdb"), 3);
        assert_eq!(*log.lock(), vec!["early", "middle", "late", "late2"]);
    }

    #[test]
    fn reregistering_a_name_replaces_and_reorders() {
        let mut hub = InstrumentationHub::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        hub.set_committed_notification(0, "a", recording_committed(&log, "a1"));
        hub.set_committed_notification(1, "b", recording_committed(&log, "b"));
        // Same name, new priority: the old slot is gone.
        hub.set_committed_notification(2, "a", recording_committed(&log, "a2"));

        let state = hub.state_weak().unwrap().upgrade().unwrap();
        state.dispatch_committed(Path::new("a.qdb"), 1);
        assert_eq!(*log.lock(), vec!["b", "a2"]);
    }

    #[test]
    fn unset_removes_only_the_named_entry() {
        let mut hub = InstrumentationHub::new();
        let log = Arc::new(PlMutex::new(Vec::new()));
        hub.set_committed_notification(0, "keep", recording_committed(&log, "keep"));
        hub.set_committed_notification(0, "drop", recording_committed(&log, "drop"));
        hub.unset_committed_notification("drop");
        assert!(hub.has_committed());

        let state = hub.state_weak().unwrap().upgrade().unwrap();
        state.dispatch_committed(Path::new("a.qdb"), 1);
        assert_eq!(*log.lock(), vec!["keep"]);
    }

    #[test]
    fn unmaterialized_hub_dispatches_nothing() {
        let hub = InstrumentationHub::new();
        assert!(hub.state_weak().is_none());
        assert!(!hub.has_committed());
        hub.trace_sql("SELECT * FROM t");
        hub.will_step(Path::new("a.qdb"), "SELECT * FROM t");
        hub.record_cost(None, "SELECT * FROM t", Duration::ZERO, StatementKind::Normal);
    }

    #[test]
    fn busy_dispatch_or_joins_votes() {
        let mut hub = InstrumentationHub::new();
        hub.set_busy_notification("no", Some(Arc::new(|_, _| false)));
        let state = hub.state_weak().unwrap().upgrade().unwrap();
        assert!(!state.dispatch_busy(Path::new("a.qdb"), 1));

        hub.set_busy_notification("yes", Some(Arc::new(|_, attempts| attempts < 3)));
        assert!(state.dispatch_busy(Path::new("a.qdb"), 2));
        assert!(!state.dispatch_busy(Path::new("a.qdb"), 3));
    }

    #[test]
    fn aggregation_window_accumulates_then_flushes_once() {
        let mut hub = InstrumentationHub::new();
        let flushed: Arc<PlMutex<Vec<(Option<i64>, u32, Duration)>>> =
            Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        hub.set_performance_tracer(
            "test",
            Some(Arc::new(move |tag, footprints, cost| {
                let total: u32 = footprints.values().sum();
                sink.lock().push((tag, total, cost));
            })),
        );

        hub.begin_aggregation();
        hub.record_cost(
            Some(9),
            "INSERT INTO t VALUES (1)",
            Duration::from_millis(2),
            StatementKind::Normal,
        );
        hub.record_cost(
            Some(9),
            "INSERT INTO t VALUES (1)",
            Duration::from_millis(3),
            StatementKind::Normal,
        );
        hub.record_cost(
            Some(9),
            "COMMIT",
            Duration::from_millis(1),
            StatementKind::CommitTransaction,
        );
        assert!(flushed.lock().is_empty());

        hub.flush_aggregation(Some(9));
        let entries = flushed.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], (Some(9), 3, Duration::from_millis(6)));
    }

    #[test]
    fn standalone_statement_flushes_immediately() {
        let mut hub = InstrumentationHub::new();
        let flushed = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        hub.set_performance_tracer(
            "test",
            Some(Arc::new(move |_tag, footprints, _cost| {
                sink.lock().push(footprints.len());
            })),
        );

        hub.record_cost(
            None,
            "DELETE FROM t",
            Duration::from_millis(1),
            StatementKind::Normal,
        );
        assert_eq!(*flushed.lock(), vec![1]);

        // Transaction-control cost outside a window is swallowed.
        hub.record_cost(
            None,
            "ROLLBACK",
            Duration::from_millis(1),
            StatementKind::RollbackTransaction,
        );
        assert_eq!(*flushed.lock(), vec![1]);
    }

    #[test]
    fn discard_drops_pending_aggregate() {
        let mut hub = InstrumentationHub::new();
        let flushed = Arc::new(PlMutex::new(0usize));
        let sink = Arc::clone(&flushed);
        hub.set_performance_tracer(
            "test",
            Some(Arc::new(move |_, _, _| *sink.lock() += 1)),
        );

        hub.begin_aggregation();
        hub.record_cost(
            None,
            "INSERT INTO t VALUES (1)",
            Duration::from_millis(1),
            StatementKind::Normal,
        );
        hub.discard_aggregation();
        hub.flush_aggregation(None);
        assert_eq!(*flushed.lock(), 0);
    }

    #[test]
    fn weak_state_degrades_after_hub_drop() {
        let mut hub = InstrumentationHub::new();
        hub.set_checkpointed_notification("x", Some(Arc::new(|_| {})));
        let weak = hub.state_weak().unwrap();
        drop(hub);
        assert!(weak.upgrade().is_none());
    }
}
