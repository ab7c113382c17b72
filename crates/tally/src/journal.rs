//! Journals: groups of entries posted together.

use std::cell::RefCell;
use std::rc::Rc;

use tally_core::{BadIdentifier, Connection, Error, Id, Result, Value};
use tally_session::{Database, Handle, IdentityMap, PersistentBase, PersistentObject};

use crate::config::DayNumber;
use crate::entry::Entry;
use crate::field;
use crate::ledger::Ledger;

const TABLE: &str = "journals";

/// Whether a journal has been posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalKind {
    /// Posted on `date`; its entries count toward balances.
    Ordinary { date: DayNumber },
    /// Saved for later under a unique name; its entries do not count.
    Draft { name: String },
}

#[derive(Default)]
struct JournalData {
    comment: Option<String>,
    kind: Option<JournalKind>,
}

pub struct Journal {
    base: PersistentBase<Ledger>,
    data: RefCell<JournalData>,
    // Entries deleted by a removal that has not committed yet.
    removed_entries: RefCell<Vec<Id>>,
}

impl Journal {
    pub fn comment(&self) -> Result<String> {
        self.load()?;
        Ok(self.data.borrow().comment.clone().unwrap_or_default())
    }

    pub fn kind(&self) -> Result<JournalKind> {
        self.load()?;
        field::get(self.data.borrow().kind.as_ref(), TABLE, "kind")
    }

    pub fn is_ordinary(&self) -> Result<bool> {
        Ok(matches!(self.kind()?, JournalKind::Ordinary { .. }))
    }

    pub fn set_comment(&self, comment: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().comment = Some(comment.to_string());
        Ok(())
    }

    pub fn set_kind(&self, kind: JournalKind) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().kind = Some(kind);
        Ok(())
    }

    /// Handles to the saved entries of this journal, in entry order.
    pub fn entries(&self) -> Result<Vec<Handle<Entry>>> {
        let Some(id) = self.base().id() else {
            return Ok(Vec::new());
        };
        let ledger = self.base().database()?;
        entry_ids(ledger.connection(), id)?
            .into_iter()
            .map(|entry_id| Handle::<Entry>::with_id_unchecked(&ledger, entry_id))
            .collect()
    }

    fn insert_detail(&self, db: &Ledger, id: Id) -> Result<()> {
        let kind = field::require(self.data.borrow().kind.as_ref(), TABLE, "kind")?;
        match kind {
            JournalKind::Ordinary { date } => db.connection().execute(
                "insert into ordinary_journal_detail(journal_id, date) values(?, ?)",
                &[Value::BigInt(id), Value::BigInt(date)],
            )?,
            JournalKind::Draft { name } => db.connection().execute(
                "insert into draft_journal_detail(journal_id, name) values(?, ?)",
                &[Value::BigInt(id), Value::Text(name)],
            )?,
        };
        Ok(())
    }

    fn delete_detail(db: &Ledger, id: Id) -> Result<()> {
        let conn = db.connection();
        conn.execute(
            "delete from ordinary_journal_detail where journal_id = ?",
            &[Value::BigInt(id)],
        )?;
        conn.execute(
            "delete from draft_journal_detail where journal_id = ?",
            &[Value::BigInt(id)],
        )?;
        Ok(())
    }
}

fn entry_ids<C: Connection + ?Sized>(conn: &C, journal_id: Id) -> Result<Vec<Id>> {
    conn.query(
        "select entry_id from entries where journal_id = ? order by entry_id",
        &[Value::BigInt(journal_id)],
    )?
    .iter()
    .map(|row| row.get_as(0))
    .collect()
}

fn mark_entry_accounts_stale(db: &Ledger, journal_id: Id) -> Result<()> {
    for row in db.connection().query(
        "select distinct account_id from entries where journal_id = ?",
        &[Value::BigInt(journal_id)],
    )? {
        db.mark_account_balance_stale(row.get_as(0)?);
    }
    Ok(())
}

impl PersistentObject for Journal {
    type Database = Ledger;

    fn primary_table_name() -> &'static str {
        TABLE
    }

    fn primary_key_name() -> &'static str {
        "journal_id"
    }

    fn new_instance(base: PersistentBase<Ledger>) -> Self {
        Self {
            base,
            data: RefCell::default(),
            removed_entries: RefCell::default(),
        }
    }

    fn base(&self) -> &PersistentBase<Ledger> {
        &self.base
    }

    fn identity_map(db: &Ledger) -> &IdentityMap<Self> {
        &db.journals
    }

    fn do_load(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let row = db
            .connection()
            .query_one(
                "select j.comment, o.date, d.name from journals j \
                 left join ordinary_journal_detail o on o.journal_id = j.journal_id \
                 left join draft_journal_detail d on d.journal_id = j.journal_id \
                 where j.journal_id = ?",
                &[Value::BigInt(id)],
            )?
            .ok_or_else(|| BadIdentifier { table: TABLE, id })?;
        let date: Option<DayNumber> = row.get_as(1)?;
        let name: Option<String> = row.get_as(2)?;
        let kind = match (date, name) {
            (Some(date), _) => JournalKind::Ordinary { date },
            (None, Some(name)) => JournalKind::Draft { name },
            (None, None) => {
                return Err(Error::Logic(format!("journal {} has no detail row", id)));
            }
        };
        let mut data = self.data.borrow_mut();
        data.comment = row.get_as(0)?;
        data.kind = Some(kind);
        Ok(())
    }

    fn do_save_existing(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let comment = self.data.borrow().comment.clone().unwrap_or_default();
        db.connection().execute(
            "update journals set comment = ? where journal_id = ?",
            &[Value::Text(comment), Value::BigInt(id)],
        )?;
        Self::delete_detail(db, id)?;
        self.insert_detail(db, id)?;
        mark_entry_accounts_stale(db, id)
    }

    fn do_save_new(&self, db: &Rc<Ledger>, _prospective_id: Id) -> Result<()> {
        field::require(self.data.borrow().kind.as_ref(), TABLE, "kind")?;
        let comment = self.data.borrow().comment.clone().unwrap_or_default();
        let id = db.connection().insert(
            "insert into journals(comment) values(?)",
            &[Value::Text(comment)],
        )?;
        self.insert_detail(db, id)
    }

    /// Deletes the journal's entries with it.
    fn do_remove(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let conn = db.connection();
        let entries = entry_ids(conn, id)?;
        mark_entry_accounts_stale(db, id)?;
        conn.execute("delete from entries where journal_id = ?", &[Value::BigInt(id)])?;
        Self::delete_detail(db, id)?;
        conn.execute(
            "delete from journals where journal_id = ?",
            &[Value::BigInt(id)],
        )?;
        *self.removed_entries.borrow_mut() = entries;
        Ok(())
    }

    /// Cached instances of the deleted entries lose their ids only now that
    /// the deletion has committed.
    fn do_after_remove(&self, db: &Rc<Ledger>, _removed_id: Id) -> Result<()> {
        let removed = std::mem::take(&mut *self.removed_entries.borrow_mut());
        for entry_id in removed {
            if let Some(entry) = db.entries.cached_handle(entry_id)? {
                entry.forget_deleted_row()?;
            }
        }
        Ok(())
    }

    fn do_ghostify(&self) {
        *self.data.borrow_mut() = JournalData::default();
    }
}
