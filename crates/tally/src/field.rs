//! Access to optional entity fields.

use tally_core::{Error, ObjectErrorKind, Result};

/// A field read through a getter. Missing means it was never set.
pub(crate) fn get<T: Clone>(value: Option<&T>, table: &'static str, name: &str) -> Result<T> {
    value.cloned().ok_or_else(|| {
        Error::object(
            ObjectErrorKind::Uninitialized,
            table,
            format!("{} has not been set", name),
        )
    })
}

/// A field needed to write the row. Missing means the object is incomplete.
pub(crate) fn require<T: Clone>(value: Option<&T>, table: &'static str, name: &str) -> Result<T> {
    value.cloned().ok_or_else(|| {
        Error::object(
            ObjectErrorKind::Incomplete,
            table,
            format!("{} is required before saving", name),
        )
    })
}
