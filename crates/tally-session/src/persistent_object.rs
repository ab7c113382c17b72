//! Lifecycle of objects that mirror one database row.
//!
//! Every persistent type embeds a [`PersistentBase`] holding its identity,
//! its loading status and the number of live [`Handle`](crate::Handle)s, and
//! implements [`PersistentObject`] to supply the type-specific load and save
//! bodies. The provided methods of the trait drive the state machine:
//!
//! ```text
//! ghost --load()--> loading --do_load ok--> loaded
//!   ^                  |                      |
//!   +---do_load err----+                      |
//!   +---------------ghostify()----------------+
//! ```
//!
//! A ghost with an Id has unpopulated fields; every accessor of a derived type
//! calls [`load`](PersistentObject::load) before touching them.

use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};

use tally_core::{
    BadIdentifier, Connection, ConnectionErrorKind, DatabaseTransaction, Error, Id,
    ObjectErrorKind, OverflowErrorKind, Result, Value,
};

use crate::database::Database;
use crate::identity_map::IdentityMap;

/// Number of live handles on one object.
pub type HandleCounter = u32;

/// Key assigned by an [`IdentityMap`] to every instance it manages, whether
/// or not the instance has an Id yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(pub(crate) u64);

impl CacheKey {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingStatus {
    /// Identity only; fields not populated.
    #[default]
    Ghost,
    /// A load is in progress.
    Loading,
    /// Fields populated and consistent with the last load or save.
    Loaded,
}

/// State shared by every persistent object.
///
/// Created only by [`IdentityMap`], which hands it to
/// [`PersistentObject::new_instance`].
pub struct PersistentBase<D> {
    database: Weak<D>,
    id: Cell<Option<Id>>,
    cache_key: CacheKey,
    status: Cell<LoadingStatus>,
    handles: Cell<HandleCounter>,
}

impl<D> PersistentBase<D> {
    pub(crate) fn new(database: Weak<D>, cache_key: CacheKey, id: Option<Id>) -> Self {
        Self {
            database,
            id: Cell::new(id),
            cache_key,
            status: Cell::new(LoadingStatus::Ghost),
            handles: Cell::new(0),
        }
    }

    pub fn id(&self) -> Option<Id> {
        self.id.get()
    }

    pub fn cache_key(&self) -> CacheKey {
        self.cache_key
    }

    pub fn status(&self) -> LoadingStatus {
        self.status.get()
    }

    pub fn handle_count(&self) -> HandleCounter {
        self.handles.get()
    }

    /// Upgrade the back-reference to the owning database.
    pub fn database(&self) -> Result<Rc<D>> {
        self.database.upgrade().ok_or_else(|| {
            Error::connection(
                ConnectionErrorKind::Invalid,
                "the database owning this object has been dropped",
            )
        })
    }

    fn set_status(&self, status: LoadingStatus) {
        self.status.set(status);
    }

    fn set_id(&self, id: Option<Id>) {
        self.id.set(id);
    }

    /// Add one handle, refusing to go past `max`.
    pub(crate) fn increment_handles(&self, max: HandleCounter) -> Result<()> {
        let count = self.handles.get();
        if count >= max {
            return Err(Error::overflow(
                OverflowErrorKind::HandleCounter,
                "handle counter has reached its maximum and cannot be incremented",
            ));
        }
        self.handles.set(count + 1);
        Ok(())
    }

    /// Remove one handle. Returns `true` when the count reaches zero.
    pub(crate) fn decrement_handles(&self) -> Result<bool> {
        let count = self.handles.get();
        if count == 0 {
            return Err(Error::overflow(
                OverflowErrorKind::HandleCounter,
                "handle counter is already zero and cannot be decremented",
            ));
        }
        self.handles.set(count - 1);
        Ok(count == 1)
    }
}

impl<D> fmt::Debug for PersistentBase<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentBase")
            .field("id", &self.id.get())
            .field("cache_key", &self.cache_key)
            .field("status", &self.status.get())
            .field("handles", &self.handles.get())
            .finish_non_exhaustive()
    }
}

/// A type whose instances are the in-memory image of one row of
/// [`primary_table_name`](Self::primary_table_name).
///
/// Implementors provide storage through [`base`](Self::base), a way to find
/// their identity map, and the `do_*` bodies. Fields are kept behind interior
/// mutability because instances are shared through `Rc`.
///
/// The `do_*` bodies run inside a transaction opened by the provided methods
/// and must not call `load`, `save` or `remove` on `self`.
pub trait PersistentObject: Sized + 'static {
    type Database: Database;

    /// Most handles that may reference one instance at a time.
    const MAX_HANDLES: HandleCounter = HandleCounter::MAX;

    fn primary_table_name() -> &'static str;

    fn primary_key_name() -> &'static str;

    /// Build an instance around state created by the identity map.
    fn new_instance(base: PersistentBase<Self::Database>) -> Self;

    fn base(&self) -> &PersistentBase<Self::Database>;

    /// The identity map for this type within `db`.
    fn identity_map(db: &Self::Database) -> &IdentityMap<Self>;

    /// Populate every field from row `id`.
    fn do_load(&self, db: &Rc<Self::Database>, id: Id) -> Result<()>;

    /// Write every field to the existing row `id`.
    fn do_save_existing(&self, db: &Rc<Self::Database>, id: Id) -> Result<()>;

    /// Insert a new row. `prospective_id` is the Id the store will assign.
    fn do_save_new(&self, db: &Rc<Self::Database>, prospective_id: Id) -> Result<()>;

    /// Discard every loaded field.
    fn do_ghostify(&self);

    /// Delete row `id`.
    fn do_remove(&self, db: &Rc<Self::Database>, id: Id) -> Result<()> {
        let sql = format!(
            "delete from {} where {} = ?",
            Self::primary_table_name(),
            Self::primary_key_name()
        );
        db.connection().execute(&sql, &[Value::BigInt(id)])?;
        Ok(())
    }

    /// Runs after `remove` has committed and cleared the object. Objects
    /// whose removal deletes dependent rows release the cached instances of
    /// those rows here.
    fn do_after_remove(&self, _db: &Rc<Self::Database>, _removed_id: Id) -> Result<()> {
        Ok(())
    }

    fn do_calculate_prospective_key(&self, db: &Rc<Self::Database>) -> Result<Id> {
        db.connection().next_auto_key(Self::primary_table_name())
    }

    /// Whether a row with primary key `id` exists.
    fn exists(db: &Self::Database, id: Id) -> Result<bool> {
        let sql = format!(
            "select {key} from {table} where {key} = ?",
            key = Self::primary_key_name(),
            table = Self::primary_table_name()
        );
        Ok(db
            .connection()
            .query_one(&sql, &[Value::BigInt(id)])?
            .is_some())
    }

    /// The Id, failing if the object has never been saved.
    fn id(&self) -> Result<Id> {
        self.base().id().ok_or_else(|| {
            Error::object(
                ObjectErrorKind::Uninitialized,
                Self::primary_table_name(),
                "object has no id",
            )
        })
    }

    fn has_id(&self) -> bool {
        self.base().id().is_some()
    }

    fn cache_key(&self) -> CacheKey {
        self.base().cache_key()
    }

    fn loading_status(&self) -> LoadingStatus {
        self.base().status()
    }

    fn handle_count(&self) -> HandleCounter {
        self.base().handle_count()
    }

    fn is_orphaned(&self) -> bool {
        self.base().handle_count() == 0
    }

    /// Populate the object from the store if it is a ghost with an Id.
    ///
    /// A failure before or inside the load body leaves the object a ghost. A
    /// connection that turns invalid while the finished load is being
    /// committed does not fail the load: the object is complete in memory and
    /// the broken connection will be reported by its next use.
    #[tracing::instrument(level = "trace", skip(self), fields(table = Self::primary_table_name(), id = ?self.base().id()))]
    fn load(&self) -> Result<()> {
        let base = self.base();
        match base.status() {
            LoadingStatus::Loaded => return Ok(()),
            LoadingStatus::Loading => return Err(reentrant::<Self>("load")),
            LoadingStatus::Ghost => {}
        }
        let Some(id) = base.id() else {
            return Ok(());
        };
        let db = base.database()?;
        let conn = db.connection();

        base.set_status(LoadingStatus::Loading);
        let tx = match DatabaseTransaction::begin(conn) {
            Ok(tx) => tx,
            Err(e) => {
                base.set_status(LoadingStatus::Ghost);
                return Err(e);
            }
        };
        if let Err(e) = self.do_load(&db, id) {
            self.do_ghostify();
            base.set_status(LoadingStatus::Ghost);
            drop(tx);
            return Err(e);
        }
        match tx.commit() {
            Ok(()) => {}
            Err(e) if e.is_invalid_connection() => {
                tracing::warn!(
                    table = Self::primary_table_name(),
                    id,
                    error = %e,
                    "connection failed while closing load transaction; keeping loaded object"
                );
            }
            Err(e) => {
                self.do_ghostify();
                base.set_status(LoadingStatus::Ghost);
                if let Err(cancel) = conn.cancel_transaction() {
                    tracing::error!(error = %cancel, "failed to cancel load transaction");
                }
                return Err(e);
            }
        }
        base.set_status(LoadingStatus::Loaded);
        tracing::debug!(table = Self::primary_table_name(), id, "loaded");
        Ok(())
    }

    /// Persist the object: update its row if it has an Id, insert one
    /// otherwise.
    #[tracing::instrument(level = "debug", skip(self), fields(table = Self::primary_table_name(), id = ?self.base().id()))]
    fn save(&self) -> Result<()> {
        let base = self.base();
        if base.status() == LoadingStatus::Loading {
            return Err(reentrant::<Self>("save"));
        }
        let db = base.database()?;
        match base.id() {
            Some(id) => {
                self.load()?;
                let tx = DatabaseTransaction::begin(db.connection())?;
                self.do_save_existing(&db, id)?;
                tx.commit()?;
                tracing::debug!(table = Self::primary_table_name(), id, "saved existing");
            }
            None => {
                let tx = DatabaseTransaction::begin(db.connection())?;
                let id = self.prospective_key()?;
                self.do_save_new(&db, id)?;
                tx.commit()?;
                base.set_id(Some(id));
                Self::identity_map(&db).register_id(base.cache_key(), id)?;
                base.set_status(LoadingStatus::Loaded);
                tracing::debug!(table = Self::primary_table_name(), id, "saved new");
            }
        }
        Ok(())
    }

    /// Delete the object's row, if it has one, and turn the object back into
    /// an unsaved ghost. Saving it afterwards inserts a new row.
    fn remove(&self) -> Result<()> {
        let base = self.base();
        if base.status() == LoadingStatus::Loading {
            return Err(reentrant::<Self>("remove"));
        }
        if let Some(id) = base.id() {
            let db = base.database()?;
            let tx = DatabaseTransaction::begin(db.connection())?;
            self.do_remove(&db, id)?;
            tx.commit()?;
            Self::identity_map(&db).deregister_id(id);
            base.set_id(None);
            self.ghostify();
            tracing::debug!(table = Self::primary_table_name(), id, "removed");
            return self.do_after_remove(&db, id);
        }
        self.ghostify();
        Ok(())
    }

    /// Treat the row as deleted by a removal that has already committed:
    /// forget the Id and become an unsaved ghost.
    fn forget_deleted_row(&self) -> Result<()> {
        let base = self.base();
        if let Some(id) = base.id() {
            let db = base.database()?;
            Self::identity_map(&db).deregister_id(id);
            base.set_id(None);
        }
        self.ghostify();
        Ok(())
    }

    /// Discard loaded state so the next access reloads from the store.
    fn ghostify(&self) {
        self.do_ghostify();
        self.base().set_status(LoadingStatus::Ghost);
    }

    /// The Id a new row for this object would receive.
    fn prospective_key(&self) -> Result<Id> {
        if self.has_id() {
            return Err(Error::Logic(format!(
                "object in '{}' already has id so prospective_key does not apply",
                Self::primary_table_name()
            )));
        }
        let db = self.base().database()?;
        self.do_calculate_prospective_key(&db)
    }

    fn notify_handle_construction(&self) -> Result<()> {
        self.base().increment_handles(Self::MAX_HANDLES)
    }

    fn notify_handle_copy_construction(&self) -> Result<()> {
        self.base().increment_handles(Self::MAX_HANDLES)
    }

    fn notify_rhs_assignment(&self) -> Result<()> {
        self.base().increment_handles(Self::MAX_HANDLES)
    }

    fn notify_lhs_assignment(&self) -> Result<()> {
        release_handle(self)
    }

    fn notify_handle_destruction(&self) -> Result<()> {
        release_handle(self)
    }
}

fn reentrant<T: PersistentObject>(operation: &str) -> Error {
    Error::object(
        ObjectErrorKind::Reentrant,
        T::primary_table_name(),
        format!("{} called while the object is loading", operation),
    )
}

/// Drop one handle count and tell the identity map when none are left.
fn release_handle<T: PersistentObject>(obj: &T) -> Result<()> {
    if obj.base().decrement_handles()? {
        // A dropped database has already released its maps.
        if let Ok(db) = obj.base().database() {
            T::identity_map(&db).notify_nil_handles(obj.base().cache_key());
        }
    }
    Ok(())
}

/// A checked Id lookup that found nothing.
pub(crate) fn bad_identifier<T: PersistentObject>(id: Id) -> Error {
    Error::BadIdentifier(BadIdentifier {
        table: T::primary_table_name(),
        id,
    })
}
