//! SQLite-backed engine adapter.
//!
//! Maps the engine contract onto a single SQLite database in the engine home.
//! Each session is its own SQLite connection, so sessions see each other's
//! committed work only, and a connection close rolls back whatever its
//! sessions left open. In the default write-ahead-log mode a live copy of the
//! home directory recovers to the last commit, which is what the crash
//! simulation relies on.

use crate::engine::{
    BACKUP_URI, Connection, Cursor, Engine, EngineError, EngineResult, ErrorCode, Item, Session,
    parse_config,
};
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Database file inside the engine home.
pub const DB_FILE: &str = "engine.db";
/// Write-ahead log next to the database.
pub const WAL_FILE: &str = "engine.db-wal";
/// Shared-memory WAL index; rebuilt by recovery and never copied.
pub const SHM_FILE: &str = "engine.db-shm";
/// The configuration the home was created with.
pub const BASECFG_FILE: &str = "engine.basecfg";

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 200;

/// Engine adapter over SQLite.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl SqliteEngine {
    pub fn new() -> Self {
        SqliteEngine
    }
}

impl Engine for SqliteEngine {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn open(&self, home: &Path, config: &str) -> EngineResult<Box<dyn Connection>> {
        let settings = Settings::parse(config).inspect_err(|e| report(None, e))?;
        let conn = SqliteConnection::open(home, settings)?;
        Ok(Box::new(conn))
    }
}

/// Parsed connection configuration.
#[derive(Debug, Clone)]
struct Settings {
    source: String,
    create: bool,
    error_prefix: Option<String>,
    wal: bool,
    synchronous: Option<&'static str>,
    busy_timeout: Duration,
}

impl Settings {
    fn parse(config: &str) -> EngineResult<Self> {
        let mut settings = Settings {
            source: config.to_string(),
            create: false,
            error_prefix: None,
            wal: true,
            synchronous: None,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        };
        for entry in parse_config(config)? {
            match entry.key.as_str() {
                "create" => settings.create = entry.as_bool()?,
                "error_prefix" => settings.error_prefix = entry.value.clone(),
                "log" => {
                    for nested in parse_config(entry.value.as_deref().unwrap_or(""))? {
                        match nested.key.as_str() {
                            "enabled" => settings.wal = nested.as_bool()?,
                            // SQLite sizes and recycles its own log.
                            "file_max" | "archive" => {}
                            other => {
                                return Err(EngineError::invalid(format!(
                                    "unknown configuration key 'log.{other}'"
                                )));
                            }
                        }
                    }
                }
                "synchronous" => {
                    let level = match entry.value.as_deref() {
                        Some("off") => "OFF",
                        Some("normal") => "NORMAL",
                        Some("full") => "FULL",
                        Some("extra") => "EXTRA",
                        other => {
                            return Err(EngineError::invalid(format!(
                                "synchronous: unknown level {other:?}"
                            )));
                        }
                    };
                    settings.synchronous = Some(level);
                }
                "busy_timeout" => {
                    let ms = entry
                        .value
                        .as_deref()
                        .and_then(|v| v.parse::<u64>().ok())
                        .ok_or_else(|| {
                            EngineError::invalid("busy_timeout: expected milliseconds")
                        })?;
                    settings.busy_timeout = Duration::from_millis(ms);
                }
                other => {
                    return Err(EngineError::invalid(format!(
                        "unknown configuration key '{other}'"
                    )));
                }
            }
        }
        Ok(settings)
    }
}

/// Write an engine error to the process's stderr descriptor the way a native
/// engine's default error handler does. Exhaustion is not an error worth
/// printing.
fn report(prefix: Option<&str>, err: &EngineError) {
    if err.is_not_found() {
        return;
    }
    let line = match prefix {
        Some(prefix) => format!("{prefix}: {}\n", err.message),
        None => format!("{}\n", err.message),
    };
    let _ = std::io::stderr().lock().write_all(line.as_bytes());
}

fn sql_error(err: rusqlite::Error) -> EngineError {
    let code = match &err {
        rusqlite::Error::QueryReturnedNoRows => return EngineError::not_found(),
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                ErrorCode::Busy
            }
            rusqlite::ErrorCode::CannotOpen
            | rusqlite::ErrorCode::DiskFull
            | rusqlite::ErrorCode::SystemIoFailure => ErrorCode::Io,
            _ => ErrorCode::Internal,
        },
        _ => ErrorCode::Internal,
    };
    EngineError::new(code, err.to_string())
}

fn io_error(context: &str, err: std::io::Error) -> EngineError {
    EngineError::new(ErrorCode::Io, format!("{context}: {err}"))
}

fn to_value(item: &Item) -> Value {
    match item {
        Item::Int(n) => Value::Integer(*n),
        Item::Text(s) => Value::Text(s.clone()),
        Item::Bytes(b) => Value::Blob(b.clone()),
    }
}

fn from_value(value: Value) -> EngineResult<Item> {
    match value {
        Value::Integer(n) => Ok(Item::Int(n)),
        Value::Text(s) => Ok(Item::Text(s)),
        Value::Blob(b) => Ok(Item::Bytes(b)),
        other => Err(EngineError::new(
            ErrorCode::Internal,
            format!("unexpected stored value {other:?}"),
        )),
    }
}

/// Resolve `table:<name>` to a table name.
fn table_name(uri: &str) -> EngineResult<&str> {
    let name = uri
        .strip_prefix("table:")
        .ok_or_else(|| EngineError::invalid(format!("unsupported object URI {uri:?}")))?;
    let valid = !name.is_empty()
        && !name.starts_with("sqlite_")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(EngineError::invalid(format!("invalid table name {name:?}")));
    }
    Ok(name)
}

/// One SQLite connection, shared between a session and its cursors. Taking the
/// inner connection closes it for all of them.
#[derive(Default)]
struct Handle {
    db: RefCell<Option<rusqlite::Connection>>,
}

impl Handle {
    fn with_db<T>(
        &self,
        what: &str,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    ) -> EngineResult<T> {
        let guard = self.db.borrow();
        let db = guard.as_ref().ok_or_else(|| EngineError::closed(what))?;
        f(db).map_err(sql_error)
    }

    fn close(&self) -> EngineResult<()> {
        match self.db.borrow_mut().take() {
            Some(db) => db.close().map_err(|(_, e)| sql_error(e)),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.db.borrow().is_some()
    }
}

/// State shared by a connection and everything opened through it.
struct Shared {
    home: PathBuf,
    settings: Settings,
    handles: RefCell<Vec<Weak<Handle>>>,
    backup_holds: Cell<usize>,
    closed: Cell<bool>,
}

impl Shared {
    fn db_path(&self) -> PathBuf {
        self.home.join(DB_FILE)
    }

    fn report(&self, err: &EngineError) {
        report(self.settings.error_prefix.as_deref(), err);
    }

    /// Report a failed result before handing it back.
    fn checked<T>(&self, result: EngineResult<T>) -> EngineResult<T> {
        if let Err(e) = &result {
            self.report(e);
        }
        result
    }

    fn open_handle(&self, first: bool) -> EngineResult<Rc<Handle>> {
        if self.closed.get() {
            return Err(EngineError::closed("connection"));
        }
        let db = rusqlite::Connection::open(self.db_path()).map_err(sql_error)?;
        db.busy_timeout(self.settings.busy_timeout)
            .map_err(sql_error)?;
        // The journal mode is persistent, so only the first handle sets it.
        if first {
            let mode = if self.settings.wal { "WAL" } else { "DELETE" };
            db.query_row(&format!("PRAGMA journal_mode = {mode}"), [], |r| {
                r.get::<_, String>(0)
            })
            .map_err(sql_error)?;
        }
        if let Some(level) = self.settings.synchronous {
            db.execute_batch(&format!("PRAGMA synchronous = {level}"))
                .map_err(sql_error)?;
        }
        let handle = Rc::new(Handle {
            db: RefCell::new(Some(db)),
        });
        let mut handles = self.handles.borrow_mut();
        handles.retain(|h| h.strong_count() > 0);
        handles.push(Rc::downgrade(&handle));
        Ok(handle)
    }
}

/// A connection to an engine home.
pub struct SqliteConnection {
    shared: Rc<Shared>,
    // Keeps the database (and its log) open while no session is.
    _anchor: Rc<Handle>,
}

impl SqliteConnection {
    fn open(home: &Path, settings: Settings) -> EngineResult<Self> {
        let prefix = settings.error_prefix.clone();
        let result = Self::open_inner(home, settings);
        if let Err(e) = &result {
            report(prefix.as_deref(), e);
        }
        result
    }

    fn open_inner(home: &Path, settings: Settings) -> EngineResult<Self> {
        let db_path = home.join(DB_FILE);
        if !db_path.exists() {
            if !settings.create {
                return Err(EngineError::new(
                    ErrorCode::Io,
                    format!("{}: no engine database (open with create)", home.display()),
                ));
            }
            fs::create_dir_all(home).map_err(|e| io_error("create home", e))?;
            fs::write(home.join(BASECFG_FILE), &settings.source)
                .map_err(|e| io_error("write base configuration", e))?;
        }
        let shared = Rc::new(Shared {
            home: home.to_path_buf(),
            settings,
            handles: RefCell::new(Vec::new()),
            backup_holds: Cell::new(0),
            closed: Cell::new(false),
        });
        let anchor = shared.open_handle(true)?;
        Ok(Self {
            shared,
            _anchor: anchor,
        })
    }

    /// Number of backup cursors currently holding the home's files.
    pub fn backup_holds(&self) -> usize {
        self.shared.backup_holds.get()
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("home", &self.shared.home)
            .field("closed", &self.shared.closed.get())
            .finish()
    }
}

impl Connection for SqliteConnection {
    fn home(&self) -> &Path {
        &self.shared.home
    }

    fn open_session(&self) -> EngineResult<Box<dyn Session>> {
        let handle = self.shared.checked(self.shared.open_handle(false))?;
        Ok(Box::new(SqliteSession {
            shared: Rc::clone(&self.shared),
            handle,
            in_txn: false,
        }))
    }

    fn close(&mut self) -> EngineResult<()> {
        if self.shared.closed.replace(true) {
            return self.shared.checked(Err(EngineError::closed("connection")));
        }
        let handles: Vec<_> = self.shared.handles.borrow_mut().drain(..).collect();
        let mut first_err = None;
        for handle in handles.iter().filter_map(Weak::upgrade) {
            if let Err(e) = handle.close() {
                first_err.get_or_insert(e);
            }
        }
        self.shared.backup_holds.set(0);
        match first_err {
            Some(e) => self.shared.checked(Err(e)),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.shared.closed.get() {
            let _ = Connection::close(self);
        }
    }
}

/// A session: one SQLite connection plus transaction state.
struct SqliteSession {
    shared: Rc<Shared>,
    handle: Rc<Handle>,
    in_txn: bool,
}

impl SqliteSession {
    fn create_inner(&mut self, uri: &str, config: &str) -> EngineResult<()> {
        let name = table_name(uri)?;
        // key_format / value_format are accepted; SQLite columns are dynamically typed.
        parse_config(config)?;
        self.handle.with_db("session", |db| {
            db.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (k NOT NULL PRIMARY KEY, v) WITHOUT ROWID"
            ))
        })
    }

    fn require_table(&self, name: &str) -> EngineResult<()> {
        let found = self.handle.with_db("session", |db| {
            db.query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |_| Ok(()),
            )
            .optional()
        })?;
        found.ok_or_else(|| EngineError::invalid(format!("table:{name}: no such object")))
    }

    fn open_cursor_inner(&mut self, uri: &str) -> EngineResult<Box<dyn Cursor>> {
        if uri == BACKUP_URI {
            return Ok(Box::new(BackupCursor::open(&self.shared)?));
        }
        let name = table_name(uri)?;
        self.require_table(name)?;
        Ok(Box::new(TableCursor {
            shared: Rc::clone(&self.shared),
            handle: Rc::clone(&self.handle),
            table: name.to_string(),
            key: None,
            value: None,
            position: None,
        }))
    }

    fn begin_inner(&mut self, config: Option<&str>) -> EngineResult<()> {
        if self.in_txn {
            return Err(EngineError::invalid("transaction already running"));
        }
        for entry in parse_config(config.unwrap_or(""))? {
            match (entry.key.as_str(), entry.value.as_deref()) {
                // Every level reads a snapshot here; the stronger guarantee
                // satisfies the weaker requests.
                ("isolation", Some("snapshot" | "read-committed" | "read-uncommitted")) => {}
                ("name" | "sync", _) => {}
                (key, _) => {
                    return Err(EngineError::invalid(format!(
                        "begin_transaction: unsupported configuration '{key}'"
                    )));
                }
            }
        }
        self.handle
            .with_db("session", |db| db.execute_batch("BEGIN"))?;
        self.in_txn = true;
        Ok(())
    }

    fn finish_txn(&mut self, sql: &str) -> EngineResult<()> {
        if !self.in_txn {
            return Err(EngineError::invalid("no transaction running"));
        }
        let result = self.handle.with_db("session", |db| db.execute_batch(sql));
        self.in_txn = self
            .handle
            .with_db("session", |db| Ok(!db.is_autocommit()))
            .unwrap_or(false);
        result
    }

    fn checkpoint_inner(&mut self) -> EngineResult<()> {
        if self.in_txn {
            return Err(EngineError::invalid(
                "checkpoint not permitted in a running transaction",
            ));
        }
        // Passive: never waits on writers. A held backup cursor keeps the log
        // from being restarted, so copied files stay consistent.
        self.handle.with_db("session", |db| {
            db.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |r| r.get::<_, i64>(0))
        })?;
        Ok(())
    }

    fn truncate_inner(
        &mut self,
        uri: &str,
        start: Option<&Item>,
        stop: Option<&Item>,
    ) -> EngineResult<()> {
        let name = table_name(uri)?;
        self.require_table(name)?;
        let mut sql = format!("DELETE FROM \"{name}\" WHERE 1 = 1");
        let mut bounds = Vec::new();
        if let Some(start) = start {
            bounds.push(to_value(start));
            sql.push_str(&format!(" AND k >= ?{}", bounds.len()));
        }
        if let Some(stop) = stop {
            bounds.push(to_value(stop));
            sql.push_str(&format!(" AND k <= ?{}", bounds.len()));
        }
        self.handle
            .with_db("session", |db| db.execute(&sql, params_from_iter(bounds)))?;
        Ok(())
    }

    fn verify_inner(&mut self, uri: &str) -> EngineResult<()> {
        let name = table_name(uri)?;
        self.require_table(name)?;
        let verdict = self.handle.with_db("session", |db| {
            db.query_row(&format!("SELECT count(*) FROM \"{name}\""), [], |r| {
                r.get::<_, i64>(0)
            })?;
            db.query_row("PRAGMA integrity_check", [], |r| r.get::<_, String>(0))
        })?;
        if verdict != "ok" {
            return Err(EngineError::new(
                ErrorCode::Internal,
                format!("{uri}: verify failed: {verdict}"),
            ));
        }
        Ok(())
    }
}

impl Session for SqliteSession {
    fn create(&mut self, uri: &str, config: &str) -> EngineResult<()> {
        let result = self.create_inner(uri, config);
        self.shared.checked(result)
    }

    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn Cursor>> {
        let result = self.open_cursor_inner(uri);
        self.shared.checked(result)
    }

    fn begin_transaction(&mut self, config: Option<&str>) -> EngineResult<()> {
        let result = self.begin_inner(config);
        self.shared.checked(result)
    }

    fn commit_transaction(&mut self) -> EngineResult<()> {
        let result = self.finish_txn("COMMIT");
        self.shared.checked(result)
    }

    fn rollback_transaction(&mut self) -> EngineResult<()> {
        let result = self.finish_txn("ROLLBACK");
        self.shared.checked(result)
    }

    fn checkpoint(&mut self) -> EngineResult<()> {
        let result = self.checkpoint_inner();
        self.shared.checked(result)
    }

    fn truncate(
        &mut self,
        uri: &str,
        start: Option<&Item>,
        stop: Option<&Item>,
    ) -> EngineResult<()> {
        let result = self.truncate_inner(uri, start, stop);
        self.shared.checked(result)
    }

    fn verify(&mut self, uri: &str) -> EngineResult<()> {
        let result = self.verify_inner(uri);
        self.shared.checked(result)
    }

    fn close(&mut self) -> EngineResult<()> {
        self.in_txn = false;
        let result = self.handle.close();
        self.shared.checked(result)
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        let _ = self.handle.close();
    }
}

/// Cursor over one table, ordered by key.
struct TableCursor {
    shared: Rc<Shared>,
    handle: Rc<Handle>,
    table: String,
    key: Option<Item>,
    value: Option<Item>,
    /// Current entry when positioned.
    position: Option<(Item, Item)>,
}

impl TableCursor {
    fn step(&mut self, forward: bool) -> EngineResult<()> {
        let (cmp, order) = if forward { (">", "ASC") } else { ("<", "DESC") };
        let table = &self.table;
        let after = self.position.as_ref().map(|(k, _)| to_value(k));
        let row = self.handle.with_db("cursor", |db| {
            let map = |r: &rusqlite::Row<'_>| Ok((r.get::<_, Value>(0)?, r.get::<_, Value>(1)?));
            match &after {
                Some(k) => db
                    .query_row(
                        &format!(
                            "SELECT k, v FROM \"{table}\" WHERE k {cmp} ?1 ORDER BY k {order} LIMIT 1"
                        ),
                        params![k],
                        map,
                    )
                    .optional(),
                None => db
                    .query_row(
                        &format!("SELECT k, v FROM \"{table}\" ORDER BY k {order} LIMIT 1"),
                        [],
                        map,
                    )
                    .optional(),
            }
        })?;
        match row {
            Some((k, v)) => {
                self.position = Some((from_value(k)?, from_value(v)?));
                Ok(())
            }
            None => {
                self.position = None;
                Err(EngineError::not_found())
            }
        }
    }

    fn search_inner(&mut self) -> EngineResult<()> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| EngineError::invalid("search: key not set"))?;
        let table = &self.table;
        let found = self.handle.with_db("cursor", |db| {
            db.query_row(
                &format!("SELECT v FROM \"{table}\" WHERE k = ?1"),
                params![to_value(&key)],
                |r| r.get::<_, Value>(0),
            )
            .optional()
        })?;
        match found {
            Some(v) => {
                self.position = Some((key, from_value(v)?));
                Ok(())
            }
            None => {
                self.position = None;
                Err(EngineError::not_found())
            }
        }
    }

    fn insert_inner(&mut self) -> EngineResult<()> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| EngineError::invalid("insert: key not set"))?;
        let value = self
            .value
            .as_ref()
            .ok_or_else(|| EngineError::invalid("insert: value not set"))?;
        let table = &self.table;
        self.handle.with_db("cursor", |db| {
            db.execute(
                &format!("INSERT OR REPLACE INTO \"{table}\" (k, v) VALUES (?1, ?2)"),
                params![to_value(key), to_value(value)],
            )
        })?;
        self.position = None;
        Ok(())
    }

    fn remove_inner(&mut self) -> EngineResult<()> {
        let key = match (&self.position, &self.key) {
            (Some((k, _)), _) | (None, Some(k)) => k.clone(),
            (None, None) => return Err(EngineError::invalid("remove: key not set")),
        };
        let table = &self.table;
        let removed = self.handle.with_db("cursor", |db| {
            db.execute(
                &format!("DELETE FROM \"{table}\" WHERE k = ?1"),
                params![to_value(&key)],
            )
        })?;
        self.position = None;
        if removed == 0 {
            return Err(EngineError::not_found());
        }
        Ok(())
    }
}

impl Cursor for TableCursor {
    fn set_key(&mut self, key: Item) {
        self.position = None;
        self.key = Some(key);
    }

    fn set_value(&mut self, value: Item) {
        self.value = Some(value);
    }

    fn key(&self) -> EngineResult<Item> {
        match (&self.position, &self.key) {
            (Some((k, _)), _) | (None, Some(k)) => Ok(k.clone()),
            (None, None) => self
                .shared
                .checked(Err(EngineError::invalid("cursor key not set"))),
        }
    }

    fn value(&self) -> EngineResult<Item> {
        match (&self.position, &self.value) {
            (Some((_, v)), _) | (None, Some(v)) => Ok(v.clone()),
            (None, None) => self
                .shared
                .checked(Err(EngineError::invalid("cursor value not set"))),
        }
    }

    fn next(&mut self) -> EngineResult<()> {
        let result = self.step(true);
        self.shared.checked(result)
    }

    fn prev(&mut self) -> EngineResult<()> {
        let result = self.step(false);
        self.shared.checked(result)
    }

    fn reset(&mut self) -> EngineResult<()> {
        self.position = None;
        self.key = None;
        self.value = None;
        Ok(())
    }

    fn search(&mut self) -> EngineResult<()> {
        let result = self.search_inner();
        self.shared.checked(result)
    }

    fn insert(&mut self) -> EngineResult<()> {
        let result = self.insert_inner();
        self.shared.checked(result)
    }

    fn remove(&mut self) -> EngineResult<()> {
        let result = self.remove_inner();
        self.shared.checked(result)
    }

    fn close(&mut self) -> EngineResult<()> {
        self.position = None;
        Ok(())
    }
}

/// Enumerates the files needed to reopen the home elsewhere. While open it
/// holds a read transaction, which stops the log from being restarted under
/// the copy.
struct BackupCursor {
    shared: Rc<Shared>,
    hold: Option<Rc<Handle>>,
    files: Vec<String>,
    index: Option<usize>,
}

impl BackupCursor {
    fn open(shared: &Rc<Shared>) -> EngineResult<Self> {
        let hold = shared.open_handle(false)?;
        hold.with_db("backup cursor", |db| {
            db.execute_batch("BEGIN")?;
            db.query_row("SELECT count(*) FROM sqlite_master", [], |r| {
                r.get::<_, i64>(0)
            })
        })?;
        shared.backup_holds.set(shared.backup_holds.get() + 1);
        let files = [BASECFG_FILE, DB_FILE, WAL_FILE]
            .into_iter()
            .filter(|name| shared.home.join(name).is_file())
            .map(String::from)
            .collect();
        Ok(Self {
            shared: Rc::clone(shared),
            hold: Some(hold),
            files,
            index: None,
        })
    }

    fn check_held(&self) -> EngineResult<()> {
        match &self.hold {
            Some(hold) if hold.is_open() => Ok(()),
            _ => Err(EngineError::closed("backup cursor")),
        }
    }

    fn unsupported<T>(&self, op: &str) -> EngineResult<T> {
        self.shared.checked(Err(EngineError::new(
            ErrorCode::NotSupported,
            format!("backup cursor: {op} not supported"),
        )))
    }
}

impl Cursor for BackupCursor {
    fn set_key(&mut self, _key: Item) {}

    fn set_value(&mut self, _value: Item) {}

    fn key(&self) -> EngineResult<Item> {
        match self.index.and_then(|i| self.files.get(i)) {
            Some(name) => Ok(Item::Text(name.clone())),
            None => self
                .shared
                .checked(Err(EngineError::invalid("backup cursor not positioned"))),
        }
    }

    fn value(&self) -> EngineResult<Item> {
        self.unsupported("value")
    }

    fn next(&mut self) -> EngineResult<()> {
        self.shared.checked(self.check_held())?;
        let next = self.index.map_or(0, |i| i + 1).min(self.files.len());
        self.index = Some(next);
        if next >= self.files.len() {
            return Err(EngineError::not_found());
        }
        Ok(())
    }

    fn prev(&mut self) -> EngineResult<()> {
        self.unsupported("prev")
    }

    fn reset(&mut self) -> EngineResult<()> {
        self.index = None;
        Ok(())
    }

    fn search(&mut self) -> EngineResult<()> {
        self.unsupported("search")
    }

    fn insert(&mut self) -> EngineResult<()> {
        self.unsupported("insert")
    }

    fn remove(&mut self) -> EngineResult<()> {
        self.unsupported("remove")
    }

    fn close(&mut self) -> EngineResult<()> {
        let Some(hold) = self.hold.take() else {
            return Ok(());
        };
        if hold.is_open() {
            let holds = self.shared.backup_holds.get();
            self.shared.backup_holds.set(holds.saturating_sub(1));
        }
        self.shared.checked(hold.close())
    }
}

impl Drop for BackupCursor {
    fn drop(&mut self) {
        let _ = Cursor::close(self);
    }
}
