//! Persistent objects, handles and identity maps.
//!
//! `tally-session` keeps exactly one in-memory instance per database row:
//!
//! - [`PersistentObject`] gives a row-shaped type its ghost/loading/loaded
//!   lifecycle and insert-or-update saving
//! - [`Handle`] is the counted, shared accessor callers hold
//! - [`IdentityMap`] vends handles by Id or for new objects and evicts
//!   instances once no handle is left
//! - [`Database`] ties a backing connection to the identity maps stored
//!   alongside it
//!
//! # Example
//!
//! ```ignore
//! let a = Handle::<Account>::with_id(&db, 42)?;
//! let b = Handle::<Account>::with_id(&db, 42)?;
//! a.set_name("Groceries")?;
//! assert_eq!(b.name()?, "Groceries");
//! ```

pub mod database;
pub mod handle;
pub mod identity_map;
pub mod persistent_object;

#[cfg(test)]
pub(crate) mod testing;

pub use database::Database;
pub use handle::Handle;
pub use identity_map::IdentityMap;
pub use persistent_object::{
    CacheKey, HandleCounter, LoadingStatus, PersistentBase, PersistentObject,
};
