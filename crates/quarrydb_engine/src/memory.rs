//! Reference engine implementation.
//!
//! Tables live in memory; committed changes are staged as record frames
//! in a `-wal` file and folded into the main store file on checkpoint
//! (threshold or close). The engine understands only the statement
//! shapes the connection core issues; it performs no query planning.
//!
//! Fault injection (`inject_busy`) and the interrupt token exist so the
//! core's contention and cancellation paths can be exercised without a
//! second process.

use crate::cipher;
use crate::engine::{
    emit_log, notify_vfs_open, BusyHandler, CheckpointHook, CommitHook, Engine, InterruptHandle,
    NativeHandle, NativeStatement,
};
use crate::record::{
    decode_file_header, encode_file_header, encode_frame, scan_frames, Record, Value,
    FILE_HEADER_SIZE, FLAG_ENCRYPTED, MAIN_MAGIC, WAL_MAGIC,
};
use crate::status::{NativeError, NativeResult, Status};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

/// WAL frames accumulated before an automatic checkpoint.
const CHECKPOINT_THRESHOLD: u32 = 8;

/// The reference engine.
///
/// Cheap to clone conceptually: every handle opened from one engine
/// shares the engine's fault plan, so tests can inject contention into
/// handles they no longer hold directly.
pub struct MemoryEngine {
    faults: Arc<FaultPlan>,
}

#[derive(Default)]
struct FaultPlan {
    busy_remaining: AtomicU32,
}

impl MemoryEngine {
    /// Creates an engine with no planned faults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            faults: Arc::new(FaultPlan::default()),
        }
    }

    /// Makes the next `n` attempts of mutating operations report lock
    /// contention. Each attempt (including retries granted by a busy
    /// handler) consumes one unit.
    pub fn inject_busy(&self, n: u32) {
        self.faults.busy_remaining.store(n, Ordering::SeqCst);
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MemoryEngine {
    fn open(&self, path: &Path) -> NativeResult<Box<dyn NativeHandle>> {
        notify_vfs_open(path);
        let readonly = std::fs::metadata(path)
            .map(|m| m.permissions().readonly())
            .unwrap_or(false);
        Ok(Box::new(MemoryHandle {
            state: Arc::new(Mutex::new(DbState::new(
                path.to_path_buf(),
                Arc::clone(&self.faults),
                readonly,
            ))),
            interrupt: Arc::new(Interruptor(AtomicBool::new(false))),
        }))
    }
}

struct Interruptor(AtomicBool);

impl InterruptHandle for Interruptor {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct MemoryHandle {
    state: Arc<Mutex<DbState>>,
    interrupt: Arc<Interruptor>,
}

impl NativeHandle for MemoryHandle {
    fn prepare(&mut self, sql: &str) -> NativeResult<Box<dyn NativeStatement>> {
        let cmd = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NativeError::new(Status::MISUSE, "handle is closed"));
            }
            state.ensure_loaded()?;
            let cmd = Command::parse(sql)?;
            state.check_tables(&cmd)?;
            cmd
        };
        Ok(Box::new(MemStatement {
            state: Arc::clone(&self.state),
            interrupt: Arc::clone(&self.interrupt),
            cmd,
            rows: None,
            row_index: 0,
            current: None,
            done: false,
        }))
    }

    fn last_insert_rowid(&self) -> i64 {
        self.state.lock().last_rowid
    }

    fn changes(&self) -> u64 {
        self.state.lock().changes
    }

    fn is_readonly(&self) -> bool {
        self.state.lock().readonly
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::clone(&self.interrupt) as Arc<dyn InterruptHandle>
    }

    fn set_busy_handler(&mut self, handler: Option<BusyHandler>) {
        self.state.lock().busy_handler = handler;
    }

    fn set_commit_hook(&mut self, hook: Option<CommitHook>) {
        self.state.lock().commit_hook = hook;
    }

    fn set_checkpoint_hook(&mut self, hook: Option<CheckpointHook>) {
        self.state.lock().checkpoint_hook = hook;
    }

    fn set_cipher_key(&mut self, key: &[u8]) -> NativeResult<()> {
        let mut state = self.state.lock();
        if state.loaded && state.file_existed && !state.encrypted {
            return Err(NativeError::new(
                Status::MISUSE,
                "cannot key an existing unencrypted store",
            ));
        }
        state.key = Some(Zeroizing::new(key.to_vec()));
        if state.loaded && !state.file_existed {
            state.encrypted = true;
        }
        Ok(())
    }

    fn serialize_master(&mut self) -> NativeResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        let mut out = Vec::new();
        for (name, table) in &state.tables {
            let record = Record::Schema {
                table: name.clone(),
                columns: table.columns.clone(),
            };
            out.extend_from_slice(&encode_frame(record.type_byte(), &record.encode_payload()));
        }
        Ok(out)
    }

    fn close(&mut self) -> NativeResult<()> {
        let deferred = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(NativeError::new(Status::MISUSE, "handle already closed"));
            }
            // An open transaction dies with the handle; only committed
            // state may reach the store file.
            if state.in_txn {
                if let Some(snapshot) = state.txn_snapshot.take() {
                    state.tables = snapshot;
                }
                state.txn_log.clear();
                state.savepoints.clear();
                state.in_txn = false;
            }
            // A handle that never loaded has nothing staged to fold;
            // forcing a load here would demand the cipher key just to
            // let go of the file.
            let deferred = if state.loaded {
                state.fold_wal()?
            } else {
                Vec::new()
            };
            state.closed = true;
            deferred
        };
        fire(deferred);
        Ok(())
    }
}

struct MemStatement {
    state: Arc<Mutex<DbState>>,
    interrupt: Arc<Interruptor>,
    cmd: Command,
    rows: Option<Vec<Vec<Value>>>,
    row_index: usize,
    current: Option<Vec<Value>>,
    done: bool,
}

impl NativeStatement for MemStatement {
    fn step(&mut self) -> NativeResult<bool> {
        if self.interrupt.0.swap(false, Ordering::SeqCst) {
            self.done = true;
            return Err(NativeError::interrupted());
        }
        if self.done {
            return Ok(false);
        }
        if let Command::Select { table } = &self.cmd {
            if self.rows.is_none() {
                let state = self.state.lock();
                let t = state.table(table)?;
                self.rows = Some(t.rows.values().cloned().collect());
            }
            let rows = self.rows.as_ref().unwrap_or_else(|| unreachable!());
            if self.row_index < rows.len() {
                self.current = Some(rows[self.row_index].clone());
                self.row_index += 1;
                return Ok(true);
            }
            self.state.lock().changes = 0;
            self.done = true;
            return Ok(false);
        }
        let deferred = {
            let mut state = self.state.lock();
            state.execute(&self.cmd)?
        };
        fire(deferred);
        self.done = true;
        Ok(false)
    }

    fn reset(&mut self) {
        self.rows = None;
        self.row_index = 0;
        self.current = None;
        self.done = false;
    }

    fn readonly(&self) -> bool {
        matches!(
            self.cmd,
            Command::Select { .. }
                | Command::Savepoint(_)
                | Command::Release(_)
                | Command::RollbackTo(_)
        )
    }

    fn column_count(&self) -> usize {
        self.current.as_ref().map_or(0, Vec::len)
    }

    fn column_int(&self, index: usize) -> i64 {
        match self.current.as_ref().and_then(|r| r.get(index)) {
            Some(Value::Integer(i)) => *i,
            Some(Value::Text(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    fn column_text(&self, index: usize) -> String {
        match self.current.as_ref().and_then(|r| r.get(index)) {
            Some(Value::Text(s)) => s.clone(),
            Some(Value::Integer(i)) => i.to_string(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Command {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
    CreateTable { table: String, columns: Vec<String> },
    Insert { table: String, values: Vec<Value> },
    Delete { table: String },
    Select { table: String },
}

impl Command {
    fn parse(sql: &str) -> NativeResult<Self> {
        let s = sql.trim().trim_end_matches(';').trim();
        let upper = s.to_ascii_uppercase();
        let word = |n: usize| s.split_whitespace().nth(n).unwrap_or("").to_string();

        if upper == "BEGIN" || upper.starts_with("BEGIN ") {
            return Ok(Command::Begin);
        }
        if upper == "COMMIT" || upper == "END" {
            return Ok(Command::Commit);
        }
        if upper.starts_with("ROLLBACK TO ") {
            let name = if upper.starts_with("ROLLBACK TO SAVEPOINT ") {
                word(3)
            } else {
                word(2)
            };
            return Ok(Command::RollbackTo(name));
        }
        if upper == "ROLLBACK" {
            return Ok(Command::Rollback);
        }
        if upper.starts_with("SAVEPOINT ") {
            return Ok(Command::Savepoint(word(1)));
        }
        if upper.starts_with("RELEASE ") {
            let name = if upper.starts_with("RELEASE SAVEPOINT ") {
                word(2)
            } else {
                word(1)
            };
            return Ok(Command::Release(name));
        }
        if upper.starts_with("CREATE TABLE ") {
            let open = s.find('(').ok_or_else(|| syntax_error(s))?;
            let close = s.rfind(')').ok_or_else(|| syntax_error(s))?;
            let table = s[12..open].trim().to_string();
            if table.is_empty() || close <= open {
                return Err(syntax_error(s));
            }
            let columns: Vec<String> = s[open + 1..close]
                .split(',')
                .map(|c| {
                    c.trim()
                        .split_whitespace()
                        .next()
                        .unwrap_or("")
                        .to_string()
                })
                .filter(|c| !c.is_empty())
                .collect();
            return Ok(Command::CreateTable { table, columns });
        }
        if upper.starts_with("INSERT INTO ") {
            let table = word(2);
            let open = s.find('(').ok_or_else(|| syntax_error(s))?;
            let close = s.rfind(')').ok_or_else(|| syntax_error(s))?;
            if close <= open {
                return Err(syntax_error(s));
            }
            let values = parse_values(&s[open + 1..close])?;
            return Ok(Command::Insert { table, values });
        }
        if upper.starts_with("DELETE FROM ") {
            return Ok(Command::Delete { table: word(2) });
        }
        if upper.starts_with("SELECT ") {
            let from = s
                .split_whitespace()
                .position(|w| w.eq_ignore_ascii_case("FROM"))
                .ok_or_else(|| syntax_error(s))?;
            let table = s
                .split_whitespace()
                .nth(from + 1)
                .ok_or_else(|| syntax_error(s))?
                .to_string();
            return Ok(Command::Select { table });
        }
        Err(syntax_error(s))
    }
}

fn syntax_error(sql: &str) -> NativeError {
    let token = sql.split_whitespace().next().unwrap_or("");
    NativeError::new(Status::ERROR, format!("near \"{token}\": syntax error"))
}

fn parse_values(s: &str) -> NativeResult<Vec<Value>> {
    let mut values = Vec::new();
    let mut chars = s.char_indices().peekable();
    let mut start = 0usize;
    let mut in_quote = false;
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' if in_quote => {
                // '' is an escaped quote inside a literal
                if matches!(chars.peek(), Some((_, '\''))) {
                    chars.next();
                } else {
                    in_quote = false;
                }
            }
            '\'' => in_quote = true,
            ',' if !in_quote => {
                values.push(parse_value(&s[start..i])?);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote {
        return Err(syntax_error(s));
    }
    let tail = &s[start..];
    if !tail.trim().is_empty() {
        values.push(parse_value(tail)?);
    } else if !values.is_empty() {
        // trailing comma
        return Err(syntax_error(s));
    }
    Ok(values)
}

fn parse_value(s: &str) -> NativeResult<Value> {
    let t = s.trim();
    if t.eq_ignore_ascii_case("NULL") {
        return Ok(Value::Null);
    }
    if t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2 {
        return Ok(Value::Text(t[1..t.len() - 1].replace("''", "'")));
    }
    t.parse::<i64>()
        .map(Value::Integer)
        .map_err(|_| syntax_error(t))
}

#[derive(Clone)]
struct Table {
    columns: Vec<String>,
    rows: BTreeMap<i64, Vec<Value>>,
    next_rowid: i64,
}

struct Savepoint {
    name: String,
    tables: BTreeMap<String, Table>,
    log_len: usize,
}

enum Deferred {
    Commit(CommitHook, u32),
    Checkpoint(CheckpointHook),
}

fn fire(deferred: Vec<Deferred>) {
    for d in deferred {
        match d {
            Deferred::Commit(hook, pages) => hook(pages),
            Deferred::Checkpoint(hook) => hook(),
        }
    }
}

struct DbState {
    path: PathBuf,
    faults: Arc<FaultPlan>,
    loaded: bool,
    file_existed: bool,
    readonly: bool,
    encrypted: bool,
    key: Option<Zeroizing<Vec<u8>>>,
    kdf_salt: [u8; 16],
    tables: BTreeMap<String, Table>,
    in_txn: bool,
    txn_snapshot: Option<BTreeMap<String, Table>>,
    savepoints: Vec<Savepoint>,
    txn_log: Vec<Record>,
    wal_frames: u32,
    changes: u64,
    last_rowid: i64,
    busy_handler: Option<BusyHandler>,
    commit_hook: Option<CommitHook>,
    checkpoint_hook: Option<CheckpointHook>,
    closed: bool,
}

impl DbState {
    fn new(path: PathBuf, faults: Arc<FaultPlan>, readonly: bool) -> Self {
        Self {
            path,
            faults,
            loaded: false,
            file_existed: false,
            readonly,
            encrypted: false,
            key: None,
            kdf_salt: [0u8; 16],
            tables: BTreeMap::new(),
            in_txn: false,
            txn_snapshot: None,
            savepoints: Vec::new(),
            txn_log: Vec::new(),
            wal_frames: 0,
            changes: 0,
            last_rowid: 0,
            busy_handler: None,
            commit_hook: None,
            checkpoint_hook: None,
            closed: false,
        }
    }

    fn wal_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push("-wal");
        PathBuf::from(name)
    }

    fn table(&self, name: &str) -> NativeResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| NativeError::new(Status::ERROR, format!("no such table: {name}")))
    }

    fn check_tables(&self, cmd: &Command) -> NativeResult<()> {
        match cmd {
            Command::Insert { table, .. }
            | Command::Delete { table }
            | Command::Select { table } => {
                self.table(table)?;
            }
            Command::CreateTable { table, .. } => {
                if self.tables.contains_key(table) {
                    return Err(NativeError::new(
                        Status::ERROR,
                        format!("table {table} already exists"),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn ensure_loaded(&mut self) -> NativeResult<()> {
        if self.loaded {
            return Ok(());
        }
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                self.file_existed = true;
                let header = decode_file_header(&bytes, MAIN_MAGIC)?;
                self.encrypted = header.flags & FLAG_ENCRYPTED != 0;
                self.kdf_salt = header.kdf_salt;
                if self.encrypted && self.key.is_none() {
                    return Err(NativeError::not_a_database());
                }
                self.apply_file(&bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.file_existed = false;
                self.encrypted = self.key.is_some();
            }
            Err(e) => return Err(e.into()),
        }
        // Replay any frames staged in the WAL but not yet folded.
        match std::fs::read(self.wal_path()) {
            Ok(bytes) => {
                decode_file_header(&bytes, WAL_MAGIC)?;
                self.wal_frames = self.replay_wal_frames(&bytes)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.loaded = true;
        Ok(())
    }

    fn apply_file(&mut self, bytes: &[u8]) -> NativeResult<()> {
        let (frames, _) = scan_frames(bytes, FILE_HEADER_SIZE, false)?;
        for frame in frames {
            let record = self.decode_frame(frame.type_byte, &frame.payload)?;
            self.apply(record);
        }
        Ok(())
    }

    fn replay_wal_frames(&mut self, bytes: &[u8]) -> NativeResult<u32> {
        let (frames, _) = scan_frames(bytes, FILE_HEADER_SIZE, false)?;
        let count = frames.len() as u32;
        for frame in frames {
            let record = self.decode_frame(frame.type_byte, &frame.payload)?;
            self.apply(record);
        }
        Ok(count)
    }

    fn decode_frame(&self, type_byte: u8, payload: &[u8]) -> NativeResult<Record> {
        if self.encrypted {
            let key = self.key.as_ref().ok_or_else(NativeError::not_a_database)?;
            let plain = cipher::decrypt_payload(
                key,
                &self.kdf_salt,
                cipher::DEFAULT_PAGE_SIZE,
                payload,
            )
            .map_err(|_| NativeError::not_a_database())?;
            Record::decode_payload(type_byte, &plain)
        } else {
            Record::decode_payload(type_byte, payload)
        }
    }

    fn apply(&mut self, record: Record) {
        match record {
            Record::Schema { table, columns } => {
                self.tables.entry(table).or_insert_with(|| Table {
                    columns,
                    rows: BTreeMap::new(),
                    next_rowid: 1,
                });
            }
            Record::Row {
                table,
                rowid,
                values,
            } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.insert(rowid, values);
                    t.next_rowid = t.next_rowid.max(rowid + 1);
                }
            }
            Record::Delete { table, rowid } => {
                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.remove(&rowid);
                }
            }
        }
    }

    fn busy_gate(&mut self) -> NativeResult<()> {
        let mut attempts = 0i32;
        while self.faults.busy_remaining.load(Ordering::SeqCst) > 0 {
            self.faults.busy_remaining.fetch_sub(1, Ordering::SeqCst);
            match self.busy_handler.as_mut() {
                Some(handler) => {
                    if handler(attempts) {
                        attempts += 1;
                    } else {
                        return Err(NativeError::busy());
                    }
                }
                None => return Err(NativeError::busy()),
            }
        }
        Ok(())
    }

    fn guard_writable(&self) -> NativeResult<()> {
        if self.readonly {
            return Err(NativeError::new(
                Status::READONLY,
                "attempt to write a readonly database",
            ));
        }
        Ok(())
    }

    fn execute(&mut self, cmd: &Command) -> NativeResult<Vec<Deferred>> {
        match cmd {
            Command::Begin => {
                if self.in_txn {
                    return Err(NativeError::new(
                        Status::ERROR,
                        "cannot start a transaction within a transaction",
                    ));
                }
                self.busy_gate()?;
                self.txn_snapshot = Some(self.tables.clone());
                self.in_txn = true;
                self.changes = 0;
                Ok(Vec::new())
            }
            Command::Commit => {
                if !self.in_txn {
                    return Err(NativeError::new(
                        Status::ERROR,
                        "cannot commit - no transaction is active",
                    ));
                }
                self.busy_gate()?;
                let records = std::mem::take(&mut self.txn_log);
                let deferred = self.commit_records(&records)?;
                self.txn_snapshot = None;
                self.savepoints.clear();
                self.in_txn = false;
                Ok(deferred)
            }
            Command::Rollback => {
                if !self.in_txn {
                    return Err(NativeError::new(
                        Status::ERROR,
                        "cannot rollback - no transaction is active",
                    ));
                }
                if let Some(snapshot) = self.txn_snapshot.take() {
                    self.tables = snapshot;
                }
                self.txn_log.clear();
                self.savepoints.clear();
                self.in_txn = false;
                Ok(Vec::new())
            }
            Command::Savepoint(name) => {
                self.savepoints.push(Savepoint {
                    name: name.clone(),
                    tables: self.tables.clone(),
                    log_len: self.txn_log.len(),
                });
                Ok(Vec::new())
            }
            Command::Release(name) => {
                let index = self.find_savepoint(name)?;
                self.savepoints.truncate(index);
                if self.savepoints.is_empty() && !self.in_txn {
                    let records = std::mem::take(&mut self.txn_log);
                    return self.commit_records(&records);
                }
                Ok(Vec::new())
            }
            Command::RollbackTo(name) => {
                let index = self.find_savepoint(name)?;
                let sp = &self.savepoints[index];
                self.tables = sp.tables.clone();
                let log_len = sp.log_len;
                self.txn_log.truncate(log_len);
                // The savepoint itself survives a rollback-to.
                self.savepoints.truncate(index + 1);
                Ok(Vec::new())
            }
            Command::CreateTable { table, columns } => {
                self.guard_writable()?;
                self.busy_gate()?;
                if self.tables.contains_key(table) {
                    return Err(NativeError::new(
                        Status::ERROR,
                        format!("table {table} already exists"),
                    ));
                }
                self.tables.insert(
                    table.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: BTreeMap::new(),
                        next_rowid: 1,
                    },
                );
                self.txn_log.push(Record::Schema {
                    table: table.clone(),
                    columns: columns.clone(),
                });
                self.changes = 0;
                self.maybe_autocommit()
            }
            Command::Insert { table, values } => {
                self.guard_writable()?;
                self.busy_gate()?;
                let t = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| NativeError::new(Status::ERROR, format!("no such table: {table}")))?;
                let rowid = t.next_rowid;
                t.next_rowid += 1;
                t.rows.insert(rowid, values.clone());
                self.last_rowid = rowid;
                self.changes = 1;
                self.txn_log.push(Record::Row {
                    table: table.clone(),
                    rowid,
                    values: values.clone(),
                });
                self.maybe_autocommit()
            }
            Command::Delete { table } => {
                self.guard_writable()?;
                self.busy_gate()?;
                let t = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| NativeError::new(Status::ERROR, format!("no such table: {table}")))?;
                let rowids: Vec<i64> = t.rows.keys().copied().collect();
                t.rows.clear();
                self.changes = rowids.len() as u64;
                for rowid in rowids {
                    self.txn_log.push(Record::Delete {
                        table: table.clone(),
                        rowid,
                    });
                }
                self.maybe_autocommit()
            }
            Command::Select { .. } => Ok(Vec::new()),
        }
    }

    fn find_savepoint(&self, name: &str) -> NativeResult<usize> {
        self.savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| NativeError::new(Status::ERROR, format!("no such savepoint: {name}")))
    }

    fn maybe_autocommit(&mut self) -> NativeResult<Vec<Deferred>> {
        if self.in_txn || !self.savepoints.is_empty() {
            return Ok(Vec::new());
        }
        let records = std::mem::take(&mut self.txn_log);
        self.commit_records(&records)
    }

    fn commit_records(&mut self, records: &[Record]) -> NativeResult<Vec<Deferred>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let count = self.append_wal(records)?;
        self.wal_frames += count;
        let mut deferred = Vec::new();
        if let Some(hook) = &self.commit_hook {
            deferred.push(Deferred::Commit(Arc::clone(hook), count));
        }
        if self.wal_frames >= CHECKPOINT_THRESHOLD {
            deferred.extend(self.fold_wal()?);
        }
        Ok(deferred)
    }

    fn append_wal(&mut self, records: &[Record]) -> NativeResult<u32> {
        let wal_path = self.wal_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;
        if file.metadata()?.len() == 0 {
            let flags = if self.encrypted { FLAG_ENCRYPTED } else { 0 };
            file.write_all(&encode_file_header(WAL_MAGIC, flags, &self.kdf_salt))?;
        }
        for record in records {
            file.write_all(&self.encode_record(record))?;
        }
        file.flush()?;
        file.sync_all()?;
        Ok(records.len() as u32)
    }

    fn encode_record(&self, record: &Record) -> Vec<u8> {
        let payload = record.encode_payload();
        if self.encrypted {
            if let Some(key) = self.key.as_ref() {
                let sealed = cipher::encrypt_payload(
                    key,
                    &self.kdf_salt,
                    cipher::DEFAULT_PAGE_SIZE,
                    &payload,
                );
                return encode_frame(record.type_byte(), &sealed);
            }
        }
        encode_frame(record.type_byte(), &payload)
    }

    /// Rewrites the main store from the live tables and truncates the WAL.
    fn fold_wal(&mut self) -> NativeResult<Vec<Deferred>> {
        let flags = if self.encrypted { FLAG_ENCRYPTED } else { 0 };
        let mut bytes = encode_file_header(MAIN_MAGIC, flags, &self.kdf_salt);
        let records: Vec<Record> = self
            .tables
            .iter()
            .flat_map(|(name, table)| {
                let mut recs = vec![Record::Schema {
                    table: name.clone(),
                    columns: table.columns.clone(),
                }];
                recs.extend(table.rows.iter().map(|(rowid, values)| Record::Row {
                    table: name.clone(),
                    rowid: *rowid,
                    values: values.clone(),
                }));
                recs
            })
            .collect();
        for record in &records {
            bytes.extend_from_slice(&self.encode_record(record));
        }
        std::fs::write(&self.path, &bytes)?;
        match std::fs::remove_file(self.wal_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                emit_log(Status::IOERR.raw(), &format!("wal truncation failed: {e}"));
                return Err(e.into());
            }
        }
        self.wal_frames = 0;
        self.file_existed = true;
        let mut deferred = Vec::new();
        if let Some(hook) = &self.checkpoint_hook {
            deferred.push(Deferred::Checkpoint(Arc::clone(hook)));
        }
        Ok(deferred)
    }
}
