//! SQLite backing store for the tally ledger.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! Implements the synchronous `Connection` trait from tally-core on top of
//! libsqlite3 (bundled through `libsqlite3-sys`).
//!
//! # Features
//!
//! - Nestable transactions: the outermost level is a real transaction, inner
//!   levels are savepoints
//! - Per-SQL prepared statement cache with a configurable capacity
//! - `next_auto_key` for `autoincrement` tables
//! - In-memory and file-based databases
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_core::{Connection, Value};
//! use tally_sqlite::SqliteConnection;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("create table t(id integer primary key autoincrement, name text)")?;
//! assert_eq!(conn.next_auto_key("t")?, 1);
//! let id = conn.insert("insert into t(name) values(?)", &[Value::from("a")])?;
//! assert_eq!(conn.next_auto_key("t")?, id + 1);
//! ```
//!
//! # Type Mapping
//!
//! | Rust Type | SQLite Type |
//! |-----------|-------------|
//! | `bool` | INTEGER (0/1) |
//! | `i32`, `i64` | INTEGER |
//! | `f64` | REAL |
//! | `String` | TEXT |
//! | `Vec<u8>` | BLOB |
//! | `Option<T>` | NULL or T |

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{DEFAULT_STATEMENT_CACHE_CAPACITY, OpenFlags, SqliteConfig, SqliteConnection};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}
