//! Error types for ledger persistence operations.

use std::fmt;

use crate::Id;

/// The primary error type for all persistence and caching operations.
#[derive(Debug)]
pub enum Error {
    /// The backing connection is unusable
    Connection(ConnectionError),
    /// Statement preparation or execution errors
    Query(QueryError),
    /// Typed column extraction errors
    Type(TypeError),
    /// Transaction demarcation errors
    Transaction(TransactionError),
    /// Misuse of an object whose state is incomplete
    Object(ObjectError),
    /// Programming errors that can never succeed on retry
    Logic(String),
    /// A lookup by Id found no row
    BadIdentifier(BadIdentifier),
    /// Counter, key-space or arithmetic overflow
    Overflow(OverflowError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Serialization/deserialization errors
    Serde(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the database
    Connect,
    /// Operation attempted on a connection that was never opened or has failed
    Invalid,
    /// Operation attempted after `close()`
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    /// Native result code reported by the store
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Database locked by another handle
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Beginning would exceed the maximum nesting level
    NestingExceeded,
    /// End or cancel without a matching begin
    NotActive,
    /// A guard was committed or cancelled twice
    Unresolved,
}

#[derive(Debug)]
pub struct ObjectError {
    pub kind: ObjectErrorKind,
    pub table: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectErrorKind {
    /// `load` or `save` re-entered while the object is loading
    Reentrant,
    /// The object lacks state required by the operation
    Incomplete,
    /// An attribute (usually the Id) was read before it was set
    Uninitialized,
    /// The change would misread rows that depend on the object
    Conflict,
}

#[derive(Debug)]
pub struct BadIdentifier {
    pub table: &'static str,
    pub id: Id,
}

#[derive(Debug)]
pub struct OverflowError {
    pub kind: OverflowErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowErrorKind {
    /// Handle counter would exceed its maximum or drop below zero
    HandleCounter,
    /// An identity map ran out of cache keys
    CacheKey,
    /// Primary key space of a table is exhausted
    TableSize,
    /// Accumulating amounts would overflow
    Arithmetic,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Shorthand for an `Overflow` error.
    pub fn overflow(kind: OverflowErrorKind, message: impl Into<String>) -> Self {
        Error::Overflow(OverflowError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for an `Object` error.
    pub fn object(kind: ObjectErrorKind, table: &'static str, message: impl Into<String>) -> Self {
        Error::Object(ObjectError {
            kind,
            table,
            message: message.into(),
        })
    }

    /// Shorthand for a `Transaction` error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a `Connection` error without an underlying source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Is this the store reporting that the connection cannot be used?
    pub fn is_invalid_connection(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Invalid | ConnectionErrorKind::Closed,
                ..
            })
        )
    }

    pub fn is_transaction_nesting(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NestingExceeded | TransactionErrorKind::NotActive,
                ..
            })
        )
    }

    pub fn is_bad_identifier(&self) -> bool {
        matches!(self, Error::BadIdentifier(_))
    }

    /// Overflow kind, if this is an overflow error.
    pub fn overflow_kind(&self) -> Option<OverflowErrorKind> {
        match self {
            Error::Overflow(o) => Some(o.kind),
            _ => None,
        }
    }

    /// Object misuse kind, if this is an object error.
    pub fn object_kind(&self) -> Option<ObjectErrorKind> {
        match self {
            Error::Object(o) => Some(o.kind),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => match e.code {
                Some(code) => write!(f, "Query error (code {}): {}", code, e.message),
                None => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Object(e) => write!(f, "Object error on '{}': {}", e.table, e.message),
            Error::Logic(msg) => write!(f, "Logic error: {}", msg),
            Error::BadIdentifier(e) => write!(f, "{}", e),
            Error::Overflow(e) => write!(f, "Overflow: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for BadIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row with id {} in '{}'", self.id, self.table)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<BadIdentifier> for Error {
    fn from(err: BadIdentifier) -> Self {
        Error::BadIdentifier(err)
    }
}

/// Result type alias for ledger persistence operations.
pub type Result<T> = std::result::Result<T, Error>;
