//! Core types and traits for the tally ledger.
//!
//! This crate provides the store-independent building blocks:
//!
//! - `Connection` trait for synchronous, nestable database access
//! - `DatabaseTransaction` scope guard
//! - `Row` and `Value` for dynamic result handling
//! - `Error` types

pub mod connection;
pub mod error;
pub mod row;
pub mod value;

/// Integer primary key. Zero and negative values never identify a row.
pub type Id = i64;

pub use connection::{Connection, DatabaseTransaction, PreparedStatement};
pub use error::{
    BadIdentifier, ConfigError, ConnectionError, ConnectionErrorKind, Error, ObjectError,
    ObjectErrorKind, OverflowError, OverflowErrorKind, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
