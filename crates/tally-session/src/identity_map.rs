//! Identity Map pattern: at most one in-memory instance per row.
//!
//! Each map serves one persistent type within one database. Every instance it
//! creates is stored under a [`CacheKey`]; instances that have an Id are also
//! reachable through a second index from Id to cache key. Handing out the
//! cached `Rc` instead of building a new object is what makes two requests
//! for the same row observe each other's changes.
//!
//! # Eviction
//!
//! When the last handle on an instance goes away the map is told through
//! [`notify_nil_handles`](IdentityMap::notify_nil_handles):
//!
//! - caching disabled (the default): the instance is evicted at once
//! - caching enabled: instances with an Id stay cached for reuse until
//!   [`disable_caching`](IdentityMap::disable_caching) purges every orphan;
//!   instances without an Id are still evicted, since nothing could ask for
//!   them again

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tally_core::{Error, Id, OverflowErrorKind, Result};

use crate::handle::Handle;
use crate::persistent_object::{CacheKey, PersistentBase, PersistentObject, bad_identifier};

struct MapState<T> {
    objects: HashMap<CacheKey, Rc<T>>,
    id_index: HashMap<Id, CacheKey>,
    last_cache_key: u64,
}

/// Cache of the live instances of `T`.
pub struct IdentityMap<T> {
    state: RefCell<MapState<T>>,
    caching: Cell<bool>,
}

impl<T> Default for IdentityMap<T> {
    fn default() -> Self {
        Self {
            state: RefCell::new(MapState {
                objects: HashMap::new(),
                id_index: HashMap::new(),
                last_cache_key: 0,
            }),
            caching: Cell::new(false),
        }
    }
}

impl<T> fmt::Debug for IdentityMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("IdentityMap")
            .field("objects", &state.objects.len())
            .field("ids", &state.id_index.len())
            .field("caching", &self.caching.get())
            .finish()
    }
}

impl<T: PersistentObject> IdentityMap<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to a brand-new object with no Id.
    pub fn provide_handle(&self, db: &Rc<T::Database>) -> Result<Handle<T>> {
        let obj = self.create(db, None)?;
        self.attach(obj)
    }

    /// Handle to the object for row `id`, failing with `BadIdentifier` if no
    /// such row exists.
    pub fn provide_handle_for_id(&self, db: &Rc<T::Database>, id: Id) -> Result<Handle<T>> {
        check_id::<T>(id)?;
        if let Some(obj) = self.lookup(id) {
            return self.attach(obj);
        }
        if !T::exists(db, id)? {
            return Err(bad_identifier::<T>(id));
        }
        let obj = self.create(db, Some(id))?;
        self.attach(obj)
    }

    /// Handle to the object for row `id` without checking that the row
    /// exists. The first access to a missing row fails when it loads.
    pub fn unchecked_provide_handle(&self, db: &Rc<T::Database>, id: Id) -> Result<Handle<T>> {
        check_id::<T>(id)?;
        if let Some(obj) = self.lookup(id) {
            return self.attach(obj);
        }
        let obj = self.create(db, Some(id))?;
        self.attach(obj)
    }

    /// Handle to the instance already cached for `id`, if there is one.
    /// Never creates an instance.
    pub fn cached_handle(&self, id: Id) -> Result<Option<Handle<T>>> {
        self.lookup(id).map(|obj| self.attach(obj)).transpose()
    }

    /// Make the instance under `cache_key` reachable through `id` as well.
    /// Called once a new object has been saved.
    pub fn register_id(&self, cache_key: CacheKey, id: Id) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.objects.contains_key(&cache_key) {
            return Err(Error::Logic(format!(
                "cache key {} is not managed by the '{}' identity map",
                cache_key,
                T::primary_table_name()
            )));
        }
        if let Some(existing) = state.id_index.get(&id) {
            if *existing != cache_key {
                return Err(Error::Logic(format!(
                    "id {} in '{}' is already registered to another instance",
                    id,
                    T::primary_table_name()
                )));
            }
        }
        state.id_index.insert(id, cache_key);
        tracing::trace!(table = T::primary_table_name(), id, %cache_key, "registered id");
        Ok(())
    }

    /// Forget the Id of an instance whose row has been deleted.
    pub fn deregister_id(&self, id: Id) {
        self.state.borrow_mut().id_index.remove(&id);
    }

    /// The instance under `cache_key` has no handles left.
    pub fn notify_nil_handles(&self, cache_key: CacheKey) {
        let evicted = {
            let mut state = self.state.borrow_mut();
            let retain = match state.objects.get(&cache_key) {
                Some(obj) => self.caching.get() && obj.has_id(),
                None => return,
            };
            if retain {
                None
            } else {
                Self::evict(&mut state, cache_key)
            }
        };
        if evicted.is_some() {
            tracing::trace!(table = T::primary_table_name(), %cache_key, "evicted orphan");
        }
        // Dropped here, after the borrow: the instance may own handles that
        // call back into this map.
        drop(evicted);
    }

    /// Keep orphaned instances that have an Id for later reuse.
    pub fn enable_caching(&self) {
        self.caching.set(true);
    }

    /// Stop retaining orphans and evict every one currently held.
    pub fn disable_caching(&self) {
        self.caching.set(false);
        let evicted: Vec<Rc<T>> = {
            let mut state = self.state.borrow_mut();
            let orphans: Vec<CacheKey> = state
                .objects
                .iter()
                .filter(|(_, obj)| obj.is_orphaned())
                .map(|(key, _)| *key)
                .collect();
            orphans
                .into_iter()
                .filter_map(|key| Self::evict(&mut state, key))
                .collect()
        };
        tracing::debug!(
            table = T::primary_table_name(),
            purged = evicted.len(),
            "caching disabled"
        );
        drop(evicted);
    }

    pub fn is_caching(&self) -> bool {
        self.caching.get()
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.state.borrow().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().objects.is_empty()
    }

    /// Whether an instance for `id` is currently cached.
    pub fn contains_id(&self, id: Id) -> bool {
        self.state.borrow().id_index.contains_key(&id)
    }

    fn lookup(&self, id: Id) -> Option<Rc<T>> {
        let state = self.state.borrow();
        let key = state.id_index.get(&id)?;
        state.objects.get(key).cloned()
    }

    fn create(&self, db: &Rc<T::Database>, id: Option<Id>) -> Result<Rc<T>> {
        let cache_key = {
            let mut state = self.state.borrow_mut();
            let next = state.last_cache_key.checked_add(1).ok_or_else(|| {
                Error::overflow(
                    OverflowErrorKind::CacheKey,
                    format!("'{}' identity map has run out of cache keys", T::primary_table_name()),
                )
            })?;
            state.last_cache_key = next;
            CacheKey(next)
        };
        let base = PersistentBase::new(Rc::downgrade(db), cache_key, id);
        let obj = Rc::new(T::new_instance(base));

        let mut state = self.state.borrow_mut();
        state.objects.insert(cache_key, Rc::clone(&obj));
        if let Some(id) = id {
            state.id_index.insert(id, cache_key);
        }
        Ok(obj)
    }

    fn attach(&self, obj: Rc<T>) -> Result<Handle<T>> {
        let cache_key = obj.cache_key();
        let was_orphan = obj.is_orphaned();
        Handle::attach(obj).inspect_err(|_| {
            if was_orphan {
                self.notify_nil_handles(cache_key);
            }
        })
    }

    fn evict(state: &mut MapState<T>, cache_key: CacheKey) -> Option<Rc<T>> {
        let obj = state.objects.remove(&cache_key)?;
        if let Some(id) = obj.base().id() {
            if state.id_index.get(&id) == Some(&cache_key) {
                state.id_index.remove(&id);
            }
        }
        Some(obj)
    }
}

fn check_id<T: PersistentObject>(id: Id) -> Result<()> {
    if id <= 0 {
        return Err(bad_identifier::<T>(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::testing::{TestDb, Widget};
    use crate::{Handle, PersistentObject};
    use std::rc::Weak;

    #[test]
    fn same_id_same_instance() {
        let db = TestDb::open();
        let id = db.insert_widget("sprocket", 3);

        let a = Handle::<Widget>::with_id(&db, id).unwrap();
        let b = Handle::<Widget>::with_id(&db, id).unwrap();
        assert!(Handle::ptr_eq(&a, &b));
        assert_eq!(a.handle_count(), 2);
        assert_eq!(db.widgets.len(), 1);
    }

    #[test]
    fn checked_lookup_rejects_missing_rows() {
        let db = TestDb::open();
        let err = Handle::<Widget>::with_id(&db, 99).unwrap_err();
        assert!(err.is_bad_identifier());
        assert!(db.widgets.is_empty());

        assert!(Handle::<Widget>::with_id(&db, 0).unwrap_err().is_bad_identifier());
        assert!(
            Handle::<Widget>::with_id_unchecked(&db, -4)
                .unwrap_err()
                .is_bad_identifier()
        );
    }

    #[test]
    fn unchecked_lookup_defers_to_load() {
        let db = TestDb::open();
        let h = Handle::<Widget>::with_id_unchecked(&db, 99).unwrap();
        assert!(h.name().is_err());
        assert!(!h.is_loaded());
    }

    #[test]
    fn orphans_are_evicted_without_caching() {
        let db = TestDb::open();
        let id = db.insert_widget("sprocket", 3);
        let h = Handle::<Widget>::with_id(&db, id).unwrap();
        assert!(db.widgets.contains_id(id));
        drop(h);
        assert!(!db.widgets.contains_id(id));
        assert!(db.widgets.is_empty());
    }

    #[test]
    fn caching_retains_orphans_with_ids_only() {
        let db = TestDb::open();
        db.widgets.enable_caching();
        let id = db.insert_widget("sprocket", 3);

        let h = Handle::<Widget>::with_id(&db, id).unwrap();
        let weak = Handle::downgrade(&h);
        drop(h);
        assert!(db.widgets.contains_id(id));

        let fresh = Handle::<Widget>::new(&db).unwrap();
        assert_eq!(db.widgets.len(), 2);
        drop(fresh);
        assert_eq!(db.widgets.len(), 1);

        let again = Handle::<Widget>::with_id(&db, id).unwrap();
        assert!(Weak::ptr_eq(&weak, &Handle::downgrade(&again)));
        drop(again);

        db.widgets.disable_caching();
        assert!(db.widgets.is_empty());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn disable_caching_keeps_referenced_objects() {
        let db = TestDb::open();
        db.widgets.enable_caching();
        let id = db.insert_widget("sprocket", 3);
        let h = Handle::<Widget>::with_id(&db, id).unwrap();
        db.widgets.disable_caching();
        assert!(db.widgets.contains_id(id));
        drop(h);
        assert!(db.widgets.is_empty());
    }

    #[test]
    fn cache_keys_are_distinct() {
        let db = TestDb::open();
        let a = Handle::<Widget>::new(&db).unwrap();
        let b = Handle::<Widget>::new(&db).unwrap();
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(!Handle::ptr_eq(&a, &b));
    }

    #[test]
    fn register_id_rejects_unknown_keys_and_conflicts() {
        let db = TestDb::open();
        let a = Handle::<Widget>::new(&db).unwrap();
        let b = Handle::<Widget>::new(&db).unwrap();
        db.widgets.register_id(a.cache_key(), 5).unwrap();
        assert!(db.widgets.register_id(b.cache_key(), 5).is_err());
        assert!(
            db.widgets
                .register_id(crate::CacheKey(9_999), 6)
                .is_err()
        );
    }
}
