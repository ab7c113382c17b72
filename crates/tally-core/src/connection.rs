//! Database connection traits.
//!
//! - [`Connection`] - synchronous statement execution plus nestable
//!   transaction demarcation
//! - [`PreparedStatement`] - pre-compiled statement for repeated execution
//! - [`DatabaseTransaction`] - scope guard that cancels its transaction level
//!   unless committed
//!
//! Access is single-threaded: every method takes `&self` and drivers keep their
//! mutable state behind interior mutability.

use crate::Id;
use crate::error::{Error, Result, TransactionErrorKind};
use crate::row::Row;
use crate::value::Value;

/// A prepared statement for repeated execution.
///
/// The handle is a ticket into the driver's statement cache; the compiled
/// statement stays owned by the connection.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: u64,
    sql: String,
    param_count: usize,
    columns: Vec<String>,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    ///
    /// This is called by the driver, not by users directly.
    #[must_use]
    pub fn new(id: u64, sql: String, param_count: usize, columns: Vec<String>) -> Self {
        Self {
            id,
            sql,
            param_count,
            columns,
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub const fn param_count(&self) -> usize {
        self.param_count
    }

    /// Names of the result columns, empty for statements returning no rows.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Check that the right number of parameters is supplied.
    #[must_use]
    pub fn validate_params(&self, params: &[Value]) -> bool {
        params.len() == self.param_count
    }
}

/// A connection to the backing store.
///
/// Transactions nest: each `begin_transaction` must be matched by exactly one
/// `end_transaction` or `cancel_transaction`. Only the outermost level touches
/// the real store transaction; inner levels are savepoints.
pub trait Connection {
    /// Execute a query and return all rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a query and return the first row, if any.
    fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Execute a statement and return the number of rows changed.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute an INSERT and return the rowid it assigned.
    fn insert(&self, sql: &str, params: &[Value]) -> Result<Id>;

    /// Execute one or more parameterless statements, such as DDL.
    fn execute_raw(&self, sql: &str) -> Result<()>;

    /// Compile a statement for repeated execution.
    fn prepare(&self, sql: &str) -> Result<PreparedStatement>;

    fn query_prepared(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<Vec<Row>>;

    fn execute_prepared(&self, stmt: &PreparedStatement, params: &[Value]) -> Result<u64>;

    /// Open a new transaction level.
    fn begin_transaction(&self) -> Result<()>;

    /// Close the innermost transaction level, making its work durable once
    /// the outermost level ends.
    fn end_transaction(&self) -> Result<()>;

    /// Undo the innermost transaction level.
    fn cancel_transaction(&self) -> Result<()>;

    /// Number of currently open transaction levels.
    fn transaction_nesting_level(&self) -> usize;

    /// Whether the connection can still be used.
    fn is_valid(&self) -> bool;

    /// The Id that the next row inserted into `table` will receive.
    fn next_auto_key(&self, table: &str) -> Result<Id>;
}

/// Guard for one transaction level.
///
/// Dropping the guard without calling [`commit`](Self::commit) cancels the
/// level, so an early return through `?` rolls the work back.
#[derive(Debug)]
pub struct DatabaseTransaction<'c, C: Connection + ?Sized> {
    conn: &'c C,
    active: bool,
}

impl<'c, C: Connection + ?Sized> DatabaseTransaction<'c, C> {
    /// Begin a transaction level on `conn`.
    pub fn begin(conn: &'c C) -> Result<Self> {
        conn.begin_transaction()?;
        Ok(Self { conn, active: true })
    }

    pub fn connection(&self) -> &'c C {
        self.conn
    }

    /// End this level, keeping its work.
    pub fn commit(mut self) -> Result<()> {
        self.resolve()?;
        self.conn.end_transaction()
    }

    /// Cancel this level explicitly.
    pub fn cancel(mut self) -> Result<()> {
        self.resolve()?;
        self.conn.cancel_transaction()
    }

    fn resolve(&mut self) -> Result<()> {
        if !self.active {
            return Err(Error::transaction(
                TransactionErrorKind::Unresolved,
                "transaction guard already resolved",
            ));
        }
        self.active = false;
        Ok(())
    }
}

impl<C: Connection + ?Sized> Drop for DatabaseTransaction<'_, C> {
    fn drop(&mut self) {
        if self.active {
            self.active = false;
            if let Err(e) = self.conn.cancel_transaction() {
                tracing::error!(error = %e, "failed to cancel abandoned transaction");
            }
        }
    }
}
