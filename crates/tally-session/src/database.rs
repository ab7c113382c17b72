//! The application connection that persistent objects are bound to.

use tally_core::Connection;

/// An application-level database: one backing connection plus the identity
/// maps of every persistent type stored in it.
///
/// Persistent objects keep a weak reference to their `Database`, so it is
/// always held in an `Rc`.
pub trait Database: 'static {
    type Conn: Connection;

    fn connection(&self) -> &Self::Conn;
}
