//! Reference-counted access to a cached persistent object.

use std::fmt;
use std::ops::Deref;
use std::rc::Rc;
#[cfg(test)]
use std::rc::Weak;

use tally_core::{Id, Result};

use crate::persistent_object::PersistentObject;

/// Shared accessor for an instance owned by its [`IdentityMap`](crate::IdentityMap).
///
/// Every handle is counted by the instance it points to: creating, cloning or
/// assigning into a handle increments the count, dropping or assigning over
/// one decrements it. When the count reaches zero the identity map may evict
/// the instance.
///
/// Two handles for the same row always point to the same instance, so a
/// change made through one is visible through the other.
pub struct Handle<T: PersistentObject> {
    obj: Rc<T>,
}

impl<T: PersistentObject> Handle<T> {
    /// Handle to a new object with no Id.
    pub fn new(db: &Rc<T::Database>) -> Result<Self> {
        T::identity_map(db).provide_handle(db)
    }

    /// Handle to the object for row `id`. Fails with `BadIdentifier` if no
    /// row has that Id.
    pub fn with_id(db: &Rc<T::Database>, id: Id) -> Result<Self> {
        T::identity_map(db).provide_handle_for_id(db, id)
    }

    /// Handle to the object for row `id`, trusting the caller that the row
    /// exists.
    pub fn with_id_unchecked(db: &Rc<T::Database>, id: Id) -> Result<Self> {
        T::identity_map(db).unchecked_provide_handle(db, id)
    }

    pub(crate) fn attach(obj: Rc<T>) -> Result<Self> {
        obj.notify_handle_construction()?;
        Ok(Self { obj })
    }

    /// Fallible form of `clone`.
    pub fn try_clone(&self) -> Result<Self> {
        self.obj.notify_handle_copy_construction()?;
        Ok(Self {
            obj: Rc::clone(&self.obj),
        })
    }

    /// Point this handle at the instance `rhs` refers to.
    ///
    /// The right-hand instance is counted before the left-hand one is
    /// released, so assigning a handle to itself is harmless.
    pub fn assign(&mut self, rhs: &Handle<T>) -> Result<()> {
        if Rc::ptr_eq(&self.obj, &rhs.obj) {
            return Ok(());
        }
        rhs.obj.notify_rhs_assignment()?;
        let old = std::mem::replace(&mut self.obj, Rc::clone(&rhs.obj));
        old.notify_lhs_assignment()
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Rc::ptr_eq(&this.obj, &other.obj)
    }

    /// Observe the instance without counting as a handle or keeping it
    /// alive.
    #[cfg(test)]
    pub(crate) fn downgrade(this: &Self) -> Weak<T> {
        Rc::downgrade(&this.obj)
    }
}

impl<T: PersistentObject> Clone for Handle<T> {
    /// # Panics
    ///
    /// Panics if the instance already has `T::MAX_HANDLES` handles, as
    /// `Rc::clone` aborts on reference count overflow. Use
    /// [`try_clone`](Handle::try_clone) to handle that case.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(e) => panic!("cannot clone handle: {e}"),
        }
    }

    fn clone_from(&mut self, source: &Self) {
        if let Err(e) = self.assign(source) {
            panic!("cannot assign handle: {e}");
        }
    }
}

impl<T: PersistentObject> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Err(e) = self.obj.notify_handle_destruction() {
            tracing::error!(
                table = T::primary_table_name(),
                error = %e,
                "handle destruction left the handle counter inconsistent"
            );
        }
    }
}

impl<T: PersistentObject> Deref for Handle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: PersistentObject> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Handle::ptr_eq(self, other)
    }
}

impl<T: PersistentObject> Eq for Handle<T> {}

impl<T: PersistentObject> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.obj.base();
        f.debug_struct("Handle")
            .field("table", &T::primary_table_name())
            .field("id", &base.id())
            .field("cache_key", &base.cache_key())
            .field("status", &base.status())
            .finish()
    }
}
