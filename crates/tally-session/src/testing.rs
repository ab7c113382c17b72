//! In-crate test fixtures: a small database with two persistent types.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tally_core::{Connection, Error, Id, ObjectErrorKind, Result, Value};
use tally_sqlite::SqliteConnection;

use crate::{Database, IdentityMap, LoadingStatus, PersistentBase, PersistentObject};

pub(crate) struct TestDb {
    pub(crate) conn: SqliteConnection,
    pub(crate) widgets: IdentityMap<Widget>,
    pub(crate) tight: IdentityMap<TightWidget>,
}

impl TestDb {
    pub(crate) fn open() -> Rc<Self> {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw(
            "create table widgets(
                widget_id integer primary key autoincrement,
                name text not null,
                count integer not null);
             create table tight_widgets(tight_widget_id integer primary key autoincrement);",
        )
        .unwrap();
        Rc::new(Self {
            conn,
            widgets: IdentityMap::new(),
            tight: IdentityMap::new(),
        })
    }

    pub(crate) fn insert_widget(&self, name: &str, count: i64) -> Id {
        self.conn
            .insert(
                "insert into widgets(name, count) values(?, ?)",
                &[Value::from(name), Value::BigInt(count)],
            )
            .unwrap()
    }
}

impl Database for TestDb {
    type Conn = SqliteConnection;

    fn connection(&self) -> &SqliteConnection {
        &self.conn
    }
}

#[derive(Default)]
struct WidgetData {
    name: Option<String>,
    count: Option<i64>,
}

pub(crate) struct Widget {
    base: PersistentBase<TestDb>,
    data: RefCell<WidgetData>,
    pub(crate) loads: Cell<u32>,
}

impl Widget {
    pub(crate) fn name(&self) -> Result<String> {
        self.load()?;
        self.data.borrow().name.clone().ok_or_else(|| uninitialized("name"))
    }

    pub(crate) fn set_name(&self, name: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().name = Some(name.to_string());
        Ok(())
    }

    pub(crate) fn set_count(&self, count: i64) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().count = Some(count);
        Ok(())
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.loading_status() == LoadingStatus::Loaded
    }

    fn fields(&self) -> Result<(String, i64)> {
        let data = self.data.borrow();
        match (&data.name, data.count) {
            (Some(name), Some(count)) => Ok((name.clone(), count)),
            _ => Err(Error::object(
                ObjectErrorKind::Incomplete,
                Self::primary_table_name(),
                "widget needs a name and a count",
            )),
        }
    }
}

fn uninitialized(field: &str) -> Error {
    Error::object(
        ObjectErrorKind::Uninitialized,
        "widgets",
        format!("{} has not been set", field),
    )
}

impl PersistentObject for Widget {
    type Database = TestDb;

    fn primary_table_name() -> &'static str {
        "widgets"
    }

    fn primary_key_name() -> &'static str {
        "widget_id"
    }

    fn new_instance(base: PersistentBase<TestDb>) -> Self {
        Self {
            base,
            data: RefCell::default(),
            loads: Cell::new(0),
        }
    }

    fn base(&self) -> &PersistentBase<TestDb> {
        &self.base
    }

    fn identity_map(db: &TestDb) -> &IdentityMap<Self> {
        &db.widgets
    }

    fn do_load(&self, db: &Rc<TestDb>, id: Id) -> Result<()> {
        self.loads.set(self.loads.get() + 1);
        let row = db
            .conn
            .query_one(
                "select name, count from widgets where widget_id = ?",
                &[Value::BigInt(id)],
            )?
            .ok_or(Error::BadIdentifier(tally_core::BadIdentifier {
                table: "widgets",
                id,
            }))?;
        let mut data = self.data.borrow_mut();
        data.name = Some(row.get_named("name")?);
        data.count = Some(row.get_named("count")?);
        Ok(())
    }

    fn do_save_existing(&self, db: &Rc<TestDb>, id: Id) -> Result<()> {
        let (name, count) = self.fields()?;
        db.conn.execute(
            "update widgets set name = ?, count = ? where widget_id = ?",
            &[Value::Text(name), Value::BigInt(count), Value::BigInt(id)],
        )?;
        Ok(())
    }

    fn do_save_new(&self, db: &Rc<TestDb>, _prospective_id: Id) -> Result<()> {
        let (name, count) = self.fields()?;
        db.conn.insert(
            "insert into widgets(name, count) values(?, ?)",
            &[Value::Text(name), Value::BigInt(count)],
        )?;
        Ok(())
    }

    fn do_ghostify(&self) {
        *self.data.borrow_mut() = WidgetData::default();
    }
}

/// A type that allows only two handles per instance.
pub(crate) struct TightWidget {
    base: PersistentBase<TestDb>,
}

impl PersistentObject for TightWidget {
    type Database = TestDb;

    const MAX_HANDLES: crate::HandleCounter = 2;

    fn primary_table_name() -> &'static str {
        "tight_widgets"
    }

    fn primary_key_name() -> &'static str {
        "tight_widget_id"
    }

    fn new_instance(base: PersistentBase<TestDb>) -> Self {
        Self { base }
    }

    fn base(&self) -> &PersistentBase<TestDb> {
        &self.base
    }

    fn identity_map(db: &TestDb) -> &IdentityMap<Self> {
        &db.tight
    }

    fn do_load(&self, _db: &Rc<TestDb>, _id: Id) -> Result<()> {
        Ok(())
    }

    fn do_save_existing(&self, _db: &Rc<TestDb>, _id: Id) -> Result<()> {
        Ok(())
    }

    fn do_save_new(&self, db: &Rc<TestDb>, _prospective_id: Id) -> Result<()> {
        db.conn
            .insert("insert into tight_widgets default values", &[])?;
        Ok(())
    }

    fn do_ghostify(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handle;

    #[test]
    fn getters_load_once() {
        let db = TestDb::open();
        let id = db.insert_widget("sprocket", 3);
        let h = Handle::<Widget>::with_id(&db, id).unwrap();
        assert!(!h.is_loaded());
        assert_eq!(h.name().unwrap(), "sprocket");
        assert_eq!(h.name().unwrap(), "sprocket");
        assert_eq!(h.loads.get(), 1);
    }

    #[test]
    fn fresh_widget_saves_and_gets_id() {
        let db = TestDb::open();
        let h = Handle::<Widget>::new(&db).unwrap();
        h.set_name("cog").unwrap();
        h.set_count(2).unwrap();
        let expected = h.prospective_key().unwrap();
        h.save().unwrap();
        assert_eq!(h.id().unwrap(), expected);
        assert!(h.is_loaded());
    }
}
