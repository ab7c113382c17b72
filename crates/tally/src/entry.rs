//! Entries: single postings of an amount to an account.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tally_core::{BadIdentifier, Connection, Error, Id, ObjectErrorKind, Result, Value};
use tally_session::{Database, Handle, IdentityMap, PersistentBase, PersistentObject};

use crate::account::{self, Account};
use crate::decimal::Decimal;
use crate::field;
use crate::journal::Journal;
use crate::ledger::Ledger;

const TABLE: &str = "entries";

#[derive(Default)]
struct EntryData {
    journal_id: Option<Id>,
    account: Option<Handle<Account>>,
    comment: Option<String>,
    amount: Option<Decimal>,
}

/// An amount posted to one account as part of a journal.
///
/// Amounts are stored at the precision of the account's commodity.
pub struct Entry {
    base: PersistentBase<Ledger>,
    data: RefCell<EntryData>,
    // Account of the row as last loaded or saved.
    stored_account_id: Cell<Option<Id>>,
}

impl Entry {
    pub fn journal_id(&self) -> Result<Id> {
        self.load()?;
        field::get(self.data.borrow().journal_id.as_ref(), TABLE, "journal")
    }

    pub fn journal(&self) -> Result<Handle<Journal>> {
        let ledger = self.base().database()?;
        Handle::with_id(&ledger, self.journal_id()?)
    }

    pub fn account(&self) -> Result<Handle<Account>> {
        self.load()?;
        match &self.data.borrow().account {
            Some(account) => account.try_clone(),
            None => Err(Error::object(
                ObjectErrorKind::Uninitialized,
                TABLE,
                "account has not been set",
            )),
        }
    }

    pub fn comment(&self) -> Result<String> {
        self.load()?;
        Ok(self.data.borrow().comment.clone().unwrap_or_default())
    }

    pub fn amount(&self) -> Result<Decimal> {
        self.load()?;
        field::get(self.data.borrow().amount.as_ref(), TABLE, "amount")
    }

    pub fn set_journal(&self, journal: &Handle<Journal>) -> Result<()> {
        self.set_journal_id(journal.id()?)
    }

    pub fn set_journal_id(&self, journal_id: Id) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().journal_id = Some(journal_id);
        Ok(())
    }

    pub fn set_account(&self, account: &Handle<Account>) -> Result<()> {
        self.load()?;
        let account = account.try_clone()?;
        let previous = self.data.borrow_mut().account.replace(account);
        drop(previous);
        Ok(())
    }

    pub fn set_comment(&self, comment: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().comment = Some(comment.to_string());
        Ok(())
    }

    pub fn set_amount(&self, amount: Decimal) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().amount = Some(amount);
        Ok(())
    }

    /// Column values in insert order, plus the account they post to.
    fn stored_row(&self, db: &Ledger) -> Result<StoredRow> {
        let data = self.data.borrow();
        let journal_id = field::require(data.journal_id.as_ref(), TABLE, "journal")?;
        let account_id = data
            .account
            .as_ref()
            .and_then(|account| account.base().id())
            .ok_or_else(|| {
                Error::object(
                    ObjectErrorKind::Incomplete,
                    TABLE,
                    "a saved account is required before saving",
                )
            })?;
        let amount = field::require(data.amount.as_ref(), TABLE, "amount")?;
        let precision = account::precision_of(db.connection(), account_id)?.ok_or(
            BadIdentifier {
                table: "accounts",
                id: account_id,
            },
        )?;
        let amount = amount.rescale(precision)?;
        Ok(StoredRow {
            params: vec![
                Value::BigInt(journal_id),
                Value::Text(data.comment.clone().unwrap_or_default()),
                Value::BigInt(account_id),
                Value::BigInt(amount.intval()),
            ],
            account_id,
            amount,
        })
    }

    /// Record what was just written.
    fn saved(&self, row: &StoredRow) {
        self.data.borrow_mut().amount = Some(row.amount);
        self.stored_account_id.set(Some(row.account_id));
    }
}

struct StoredRow {
    params: Vec<Value>,
    account_id: Id,
    amount: Decimal,
}

impl PersistentObject for Entry {
    type Database = Ledger;

    fn primary_table_name() -> &'static str {
        TABLE
    }

    fn primary_key_name() -> &'static str {
        "entry_id"
    }

    fn new_instance(base: PersistentBase<Ledger>) -> Self {
        Self {
            base,
            data: RefCell::default(),
            stored_account_id: Cell::new(None),
        }
    }

    fn base(&self) -> &PersistentBase<Ledger> {
        &self.base
    }

    fn identity_map(db: &Ledger) -> &IdentityMap<Self> {
        &db.entries
    }

    fn do_load(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let row = db
            .connection()
            .query_one(
                "select e.journal_id, e.account_id, e.comment, e.amount, c.precision \
                 from entries e \
                 join accounts a on a.account_id = e.account_id \
                 join commodities c on c.commodity_id = a.commodity_id \
                 where e.entry_id = ?",
                &[Value::BigInt(id)],
            )?
            .ok_or_else(|| BadIdentifier { table: TABLE, id })?;
        let account_id: Id = row.get_named("account_id")?;
        let loaded = EntryData {
            journal_id: Some(row.get_named("journal_id")?),
            account: Some(Handle::with_id_unchecked(db, account_id)?),
            comment: row.get_named("comment")?,
            amount: Some(Decimal::try_new(
                row.get_named("amount")?,
                row.get_named("precision")?,
            )?),
        };
        let previous = std::mem::replace(&mut *self.data.borrow_mut(), loaded);
        drop(previous);
        self.stored_account_id.set(Some(account_id));
        Ok(())
    }

    fn do_save_existing(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let mut row = self.stored_row(db)?;
        row.params.push(Value::BigInt(id));
        db.connection().execute(
            "update entries set journal_id = ?, comment = ?, account_id = ?, amount = ? \
             where entry_id = ?",
            &row.params,
        )?;
        db.mark_account_balance_stale(row.account_id);
        if let Some(previous) = self.stored_account_id.get() {
            if previous != row.account_id {
                db.mark_account_balance_stale(previous);
            }
        }
        self.saved(&row);
        Ok(())
    }

    fn do_save_new(&self, db: &Rc<Ledger>, _prospective_id: Id) -> Result<()> {
        let row = self.stored_row(db)?;
        db.connection().insert(
            "insert into entries(journal_id, comment, account_id, amount) values(?, ?, ?, ?)",
            &row.params,
        )?;
        db.mark_account_balance_stale(row.account_id);
        self.saved(&row);
        Ok(())
    }

    fn do_remove(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let conn = db.connection();
        let account_id: Option<Id> = conn
            .query_one(
                "select account_id from entries where entry_id = ?",
                &[Value::BigInt(id)],
            )?
            .map(|row| row.get_as(0))
            .transpose()?;
        conn.execute("delete from entries where entry_id = ?", &[Value::BigInt(id)])?;
        if let Some(account_id) = account_id {
            db.mark_account_balance_stale(account_id);
        }
        Ok(())
    }

    fn do_ghostify(&self) {
        let previous = std::mem::take(&mut *self.data.borrow_mut());
        drop(previous);
        self.stored_account_id.set(None);
    }
}
