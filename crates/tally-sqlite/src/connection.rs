//! SQLite connection implementation.
//!
//! Safe wrappers around SQLite's C API implementing the `Connection` trait
//! from tally-core. Transactions nest via savepoints and compiled statements
//! are cached per SQL text.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::borrow_as_ptr)]
#![allow(clippy::if_not_else)]

use crate::ffi;
use crate::types;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::Arc;
use tally_core::{
    ColumnInfo, Connection, ConnectionErrorKind, Error, Id, OverflowErrorKind, PreparedStatement,
    QueryError, QueryErrorKind, Result, Row, TransactionErrorKind, Value,
    error::ConnectionError,
};

/// Default cap on compiled statements kept alive between executions.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 300;

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Maximum number of simultaneously open transaction levels.
    pub max_transaction_nesting: usize,
    /// Maximum number of compiled statements kept for reuse.
    pub statement_cache_capacity: usize,
    /// Enforce foreign key constraints.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write access; the database must already exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Read-write access, creating the database if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            max_transaction_nesting: i32::MAX as usize,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Create a new config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create a new config for an in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn max_transaction_nesting(mut self, levels: usize) -> Self {
        self.max_transaction_nesting = levels;
        self
    }

    pub fn statement_cache_capacity(mut self, capacity: usize) -> Self {
        self.statement_cache_capacity = capacity;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// Mutable connection state. `db` is null once the connection is closed.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    nesting: usize,
    statements: HashMap<String, *mut ffi::sqlite3_stmt>,
    next_prepared_id: u64,
}

impl SqliteInner {
    fn db(&self) -> Result<*mut ffi::sqlite3> {
        if self.db.is_null() {
            Err(Error::connection(
                ConnectionErrorKind::Closed,
                "database connection has been closed",
            ))
        } else {
            Ok(self.db)
        }
    }

    /// Take a compiled statement for `sql` out of the cache, compiling it if
    /// it is not there.
    fn checkout(&mut self, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
        let db = self.db()?;
        match self.statements.remove(sql) {
            Some(stmt) => Ok(stmt),
            None => prepare_stmt(db, sql),
        }
    }

    /// Return a statement after use, keeping it only while the cache has room.
    fn checkin(&mut self, sql: &str, stmt: *mut ffi::sqlite3_stmt, capacity: usize) {
        // SAFETY: stmt was produced by prepare_stmt on this connection
        unsafe {
            ffi::sqlite3_reset(stmt);
            ffi::sqlite3_clear_bindings(stmt);
        }
        if self.statements.len() < capacity {
            self.statements.insert(sql.to_string(), stmt);
        } else {
            // SAFETY: stmt is valid and no longer referenced
            unsafe { ffi::sqlite3_finalize(stmt) };
        }
    }

    fn finalize_all(&mut self) {
        for (_, stmt) in self.statements.drain() {
            // SAFETY: every cached statement is valid and unused
            unsafe { ffi::sqlite3_finalize(stmt) };
        }
    }

    fn exec(&self, sql: &str) -> Result<()> {
        let db = self.db()?;
        let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
        let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

        if rc != ffi::SQLITE_OK {
            let msg = if !errmsg.is_null() {
                // SAFETY: errmsg was allocated by sqlite3_exec
                let msg = unsafe { CStr::from_ptr(errmsg).to_string_lossy().into_owned() };
                unsafe { ffi::sqlite3_free(errmsg.cast()) };
                msg
            } else {
                ffi::error_string(rc).to_string()
            };
            return Err(Error::Query(QueryError {
                kind: error_code_to_kind(rc),
                sql: Some(sql.to_string()),
                message: msg,
                code: Some(rc),
            }));
        }
        Ok(())
    }
}

/// A connection to a SQLite database.
///
/// Single-threaded: the type is neither `Send` nor `Sync`.
pub struct SqliteConnection {
    inner: RefCell<SqliteInner>,
    path: String,
    max_nesting: usize,
    cache_capacity: usize,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("valid", &self.is_valid())
            .field("nesting", &self.transaction_nesting_level())
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open a new SQLite connection with the given configuration.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path))]
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if !db.is_null() {
                // SAFETY: db is a handle SQLite allocated; it must be closed even on failure
                unsafe {
                    let msg = ffi::last_error_message(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            } else {
                ffi::error_string(rc).to_string()
            };

            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            let ms = c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX);
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, ms);
            }
        }

        let conn = Self {
            inner: RefCell::new(SqliteInner {
                db,
                nesting: 0,
                statements: HashMap::new(),
                next_prepared_id: 1,
            }),
            path: config.path.clone(),
            max_nesting: config.max_transaction_nesting,
            cache_capacity: config.statement_cache_capacity,
        };

        if config.foreign_keys {
            conn.execute_raw("pragma foreign_keys = on")?;
        }
        tracing::debug!(version = ffi::version(), "opened sqlite database");
        Ok(conn)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Open a file-based database.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Execute SQL directly without preparing (for DDL, pragmas, etc.)
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        self.inner.borrow().exec(sql)
    }

    /// Get the last insert rowid.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let inner = self.inner.borrow();
        let db = inner.db()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
    }

    /// Number of compiled statements currently held for reuse.
    pub fn cached_statement_count(&self) -> usize {
        self.inner.borrow().statements.len()
    }

    /// Close the database.
    ///
    /// Any open transaction is rolled back by SQLite. Every later operation on
    /// this connection fails with a closed-connection error.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let db = inner.db()?;
        inner.finalize_all();
        // SAFETY: db is valid and all cached statements are finalized
        let rc = unsafe { ffi::sqlite3_close_v2(db) };
        inner.db = ptr::null_mut();
        inner.nesting = 0;
        if rc != ffi::SQLITE_OK {
            return Err(Error::connection(
                ConnectionErrorKind::Invalid,
                format!("Failed to close database: {}", ffi::error_string(rc)),
            ));
        }
        tracing::debug!(path = %self.path, "closed sqlite database");
        Ok(())
    }

    /// Run `sql` with `params`, handing each result row to `on_row`.
    fn run<F>(&self, sql: &str, params: &[Value], mut on_row: F) -> Result<()>
    where
        F: FnMut(Row),
    {
        let mut inner = self.inner.borrow_mut();
        let db = inner.db()?;
        let stmt = inner.checkout(sql)?;

        let result = (|| {
            for (i, param) in params.iter().enumerate() {
                // SAFETY: stmt is valid, index is 1-based
                let rc = unsafe { types::bind_value(stmt, (i + 1) as c_int, param) };
                if rc != ffi::SQLITE_OK {
                    return Err(bind_error(db, sql, i + 1, rc));
                }
            }

            // SAFETY: stmt is valid
            let columns = Arc::new(ColumnInfo::new(unsafe { types::column_names(stmt) }));
            let col_count = columns.len() as c_int;

            loop {
                // SAFETY: stmt is valid and fully bound
                match unsafe { ffi::sqlite3_step(stmt) } {
                    ffi::SQLITE_ROW => {
                        let values = (0..col_count)
                            // SAFETY: stmt just returned SQLITE_ROW
                            .map(|i| unsafe { types::read_column(stmt, i) })
                            .collect();
                        on_row(Row::with_columns(Arc::clone(&columns), values));
                    }
                    ffi::SQLITE_DONE => return Ok(()),
                    _ => return Err(step_error(db, sql)),
                }
            }
        })();

        inner.checkin(sql, stmt, self.cache_capacity);
        result
    }

    fn changes(&self) -> Result<u64> {
        let inner = self.inner.borrow();
        let db = inner.db()?;
        // SAFETY: db is valid
        let n = unsafe { ffi::sqlite3_changes(db) };
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn savepoint_name(level: usize) -> String {
        format!("tally_sp_{}", level)
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self
            .query_one(
                "select name from sqlite_master where type = 'table' and name = ?",
                &[Value::from(table)],
            )?
            .is_some())
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.db.is_null() {
            inner.finalize_all();
            // SAFETY: db is valid and all cached statements are finalized
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
            inner.db = ptr::null_mut();
        }
    }
}

impl Connection for SqliteConnection {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.run(sql, params, |row| rows.push(row))?;
        Ok(rows)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run(sql, params, |_| {})?;
        self.changes()
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<Id> {
        self.run(sql, params, |_| {})?;
        self.last_insert_rowid()
    }

    fn execute_raw(&self, sql: &str) -> Result<()> {
        SqliteConnection::execute_raw(self, sql)
    }

    fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        let mut inner = self.inner.borrow_mut();
        let stmt = inner.checkout(sql)?;

        // SAFETY: stmt is valid
        let (param_count, columns) = unsafe {
            (
                usize::try_from(ffi::sqlite3_bind_parameter_count(stmt)).unwrap_or(0),
                types::column_names(stmt),
            )
        };
        // Kept regardless of capacity so the first execution reuses it.
        inner.statements.insert(sql.to_string(), stmt);

        let id = inner.next_prepared_id;
        inner.next_prepared_id += 1;
        Ok(PreparedStatement::new(id, sql.to_string(), param_count, columns))
    }

    fn query_prepared(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<Vec<Row>> {
        check_params(stmt, params)?;
        self.query(stmt.sql(), params)
    }

    fn execute_prepared(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<u64> {
        check_params(stmt, params)?;
        self.execute(stmt.sql(), params)
    }

    fn begin_transaction(&self) -> Result<()> {
        let level = self.transaction_nesting_level();
        if level >= self.max_nesting {
            return Err(Error::transaction(
                TransactionErrorKind::NestingExceeded,
                format!("maximum transaction nesting level {} reached", self.max_nesting),
            ));
        }
        if level == 0 {
            self.execute_raw("begin transaction")?;
        } else {
            self.execute_raw(&format!("savepoint {}", Self::savepoint_name(level)))?;
        }
        self.inner.borrow_mut().nesting = level + 1;
        tracing::trace!(level = level + 1, "transaction level opened");
        Ok(())
    }

    fn end_transaction(&self) -> Result<()> {
        self.inner.borrow().db()?;
        let level = self.transaction_nesting_level();
        match level {
            0 => {
                return Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "end_transaction called with no transaction open",
                ));
            }
            1 => self.execute_raw("end transaction")?,
            n => self.execute_raw(&format!("release {}", Self::savepoint_name(n - 1)))?,
        }
        self.inner.borrow_mut().nesting = level - 1;
        tracing::trace!(level = level - 1, "transaction level closed");
        Ok(())
    }

    fn cancel_transaction(&self) -> Result<()> {
        self.inner.borrow().db()?;
        let level = self.transaction_nesting_level();
        match level {
            0 => {
                return Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "cancel_transaction called with no transaction open",
                ));
            }
            1 => self.execute_raw("rollback")?,
            n => {
                let name = Self::savepoint_name(n - 1);
                self.execute_raw(&format!("rollback to {name}; release {name}"))?;
            }
        }
        self.inner.borrow_mut().nesting = level - 1;
        tracing::debug!(level = level - 1, "transaction level cancelled");
        Ok(())
    }

    fn transaction_nesting_level(&self) -> usize {
        self.inner.borrow().nesting
    }

    fn is_valid(&self) -> bool {
        !self.inner.borrow().db.is_null()
    }

    /// Reads `sqlite_sequence`, so it is only meaningful for tables declared
    /// with `autoincrement`.
    fn next_auto_key(&self, table: &str) -> Result<Id> {
        if !self.table_exists("sqlite_sequence")? {
            return Ok(1);
        }
        let row = self.query_one(
            "select seq from sqlite_sequence where name = ?",
            &[Value::from(table)],
        )?;
        let Some(row) = row else {
            return Ok(1);
        };
        let seq: i64 = row.get_as(0)?;
        seq.checked_add(1).ok_or_else(|| {
            Error::overflow(
                OverflowErrorKind::TableSize,
                format!("primary key space of '{}' is exhausted", table),
            )
        })
    }
}

fn check_params(stmt: &PreparedStatement, params: &[Value]) -> Result<()> {
    if stmt.validate_params(params) {
        Ok(())
    } else {
        Err(Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            sql: Some(stmt.sql().to_string()),
            message: format!(
                "expected {} parameters, got {}",
                stmt.param_count(),
                params.len()
            ),
            code: Some(ffi::SQLITE_RANGE),
        }))
    }
}

fn null_byte_error(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        message: "SQL contains null byte".to_string(),
        code: None,
    })
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| null_byte_error(sql))?;
    let len = c_int::try_from(c_sql.as_bytes().len()).map_err(|_| null_byte_error(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_prepare_v2(db, c_sql.as_ptr(), len, &mut stmt, ptr::null_mut()) };

    if rc != ffi::SQLITE_OK {
        return Err(prepare_error(db, sql));
    }
    if stmt.is_null() {
        // Empty or comment-only SQL compiles to nothing.
        return Err(Error::Query(QueryError {
            kind: QueryErrorKind::Syntax,
            sql: Some(sql.to_string()),
            message: "SQL contains no statement".to_string(),
            code: None,
        }));
    }
    Ok(stmt)
}

fn prepare_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (ffi::last_error_message(db), ffi::sqlite3_errcode(db)) };
    let kind = if msg.starts_with("no such table") || msg.starts_with("no such column") {
        QueryErrorKind::NotFound
    } else if code == ffi::SQLITE_ERROR {
        QueryErrorKind::Syntax
    } else {
        error_code_to_kind(code)
    };
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message: msg,
        code: Some(code),
    })
}

fn bind_error(db: *mut ffi::sqlite3, sql: &str, param_index: usize, rc: c_int) -> Error {
    let msg = if rc == ffi::SQLITE_TOOBIG {
        ffi::error_string(rc).to_string()
    } else {
        // SAFETY: db is valid
        unsafe { ffi::last_error_message(db) }
    };
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: Some(sql.to_string()),
        message: format!("Failed to bind parameter {}: {}", param_index, msg),
        code: Some(rc),
    })
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (msg, code) = unsafe { (ffi::last_error_message(db), ffi::sqlite3_errcode(db)) };
    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        sql: Some(sql.to_string()),
        message: msg,
        code: Some(code),
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_default_to_read_write_create() {
        let flags = OpenFlags::default().to_sqlite_flags();
        assert_eq!(
            flags,
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        );
        assert_eq!(
            OpenFlags::read_only().to_sqlite_flags(),
            ffi::SQLITE_OPEN_READONLY
        );
    }

    #[test]
    fn config_builder() {
        let config = SqliteConfig::file("books.db")
            .busy_timeout(100)
            .max_transaction_nesting(3)
            .statement_cache_capacity(0)
            .foreign_keys(false);
        assert_eq!(config.path, "books.db");
        assert_eq!(config.busy_timeout_ms, 100);
        assert_eq!(config.max_transaction_nesting, 3);
        assert_eq!(config.statement_cache_capacity, 0);
        assert!(!config.foreign_keys);
    }

    #[test]
    fn savepoint_names_are_per_level() {
        assert_ne!(
            SqliteConnection::savepoint_name(1),
            SqliteConnection::savepoint_name(2)
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            error_code_to_kind(ffi::SQLITE_CONSTRAINT),
            QueryErrorKind::Constraint
        );
        assert_eq!(error_code_to_kind(ffi::SQLITE_BUSY), QueryErrorKind::Busy);
        assert_eq!(error_code_to_kind(ffi::SQLITE_MISUSE), QueryErrorKind::Database);
    }
}
