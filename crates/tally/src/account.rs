//! Accounts and account types.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tally_core::{BadIdentifier, Connection, Error, Id, ObjectErrorKind, Result, Value};
use tally_session::{Database, Handle, IdentityMap, PersistentBase, PersistentObject};

use crate::commodity::Commodity;
use crate::decimal::Decimal;
use crate::field;
use crate::ledger::Ledger;

const TABLE: &str = "accounts";

/// Kind of account. The discriminants are the stored `account_type_id`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset = 1,
    Liability,
    Equity,
    Revenue,
    Expense,
    PureEnvelope,
}

impl AccountType {
    pub const ALL: [AccountType; 6] = [
        AccountType::Asset,
        AccountType::Liability,
        AccountType::Equity,
        AccountType::Revenue,
        AccountType::Expense,
        AccountType::PureEnvelope,
    ];

    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| Error::Logic(format!("unknown account type code {}", code)))
    }

    /// Assets, liabilities and equity.
    pub fn is_balance_sheet(self) -> bool {
        matches!(
            self,
            AccountType::Asset | AccountType::Liability | AccountType::Equity
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountType::Asset => "Asset",
            AccountType::Liability => "Liability",
            AccountType::Equity => "Equity",
            AccountType::Revenue => "Revenue",
            AccountType::Expense => "Expense",
            AccountType::PureEnvelope => "Pure envelope",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct AccountData {
    name: Option<String>,
    account_type: Option<AccountType>,
    description: Option<String>,
    commodity: Option<Handle<Commodity>>,
}

/// A named account. Its balance is the sum of the entries posted to it in
/// ordinary journals.
pub struct Account {
    base: PersistentBase<Ledger>,
    data: RefCell<AccountData>,
}

impl Account {
    pub fn name(&self) -> Result<String> {
        self.load()?;
        field::get(self.data.borrow().name.as_ref(), TABLE, "name")
    }

    pub fn account_type(&self) -> Result<AccountType> {
        self.load()?;
        field::get(self.data.borrow().account_type.as_ref(), TABLE, "account type")
    }

    pub fn description(&self) -> Result<String> {
        self.load()?;
        Ok(self.data.borrow().description.clone().unwrap_or_default())
    }

    pub fn commodity(&self) -> Result<Handle<Commodity>> {
        self.load()?;
        let data = self.data.borrow();
        match &data.commodity {
            Some(commodity) => commodity.try_clone(),
            None => Err(Error::object(
                ObjectErrorKind::Uninitialized,
                TABLE,
                "commodity has not been set",
            )),
        }
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().name = Some(name.to_string());
        Ok(())
    }

    pub fn set_account_type(&self, account_type: AccountType) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().account_type = Some(account_type);
        Ok(())
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().description = Some(description.to_string());
        Ok(())
    }

    pub fn set_commodity(&self, commodity: &Handle<Commodity>) -> Result<()> {
        self.load()?;
        let commodity = commodity.try_clone()?;
        let previous = self.data.borrow_mut().commodity.replace(commodity);
        drop(previous);
        Ok(())
    }

    /// Sum of this account's ordinary entries.
    pub fn technical_balance(&self) -> Result<Decimal> {
        let ledger = self.base().database()?;
        ledger.technical_balance(self.id()?)
    }

    /// Sum of this account's entries dated on the ledger's opening balance
    /// date.
    pub fn technical_opening_balance(&self) -> Result<Decimal> {
        let ledger = self.base().database()?;
        ledger.technical_opening_balance(self.id()?)
    }

    /// Id of the account whose name matches `name` ignoring case.
    pub fn id_for_name(ledger: &Ledger, name: &str) -> Result<Option<Id>> {
        let target = name.to_lowercase();
        for row in ledger
            .connection()
            .query("select account_id, name from accounts", &[])?
        {
            let candidate: String = row.get_named("name")?;
            if candidate.to_lowercase() == target {
                return row.get_named("account_id").map(Some);
            }
        }
        Ok(None)
    }

    pub fn exists_with_name(ledger: &Ledger, name: &str) -> Result<bool> {
        Ok(Self::id_for_name(ledger, name)?.is_some())
    }

    /// Moving an account with entries to a commodity of another precision
    /// would change the meaning of its stored amounts.
    fn check_commodity_change(&self, db: &Ledger, id: Id, commodity_id: Id) -> Result<()> {
        let conn = db.connection();
        let Some(current) = precision_of(conn, id)? else {
            return Ok(());
        };
        let proposed: Option<u8> = conn
            .query_one(
                "select precision from commodities where commodity_id = ?",
                &[Value::BigInt(commodity_id)],
            )?
            .map(|row| row.get_as(0))
            .transpose()?;
        if proposed.is_none_or(|proposed| proposed == current) {
            return Ok(());
        }
        let has_entries = conn
            .query_one(
                "select entry_id from entries where account_id = ? limit 1",
                &[Value::BigInt(id)],
            )?
            .is_some();
        if has_entries {
            return Err(Error::object(
                ObjectErrorKind::Conflict,
                TABLE,
                format!(
                    "account {} has entries and cannot move to a commodity of another precision",
                    id
                ),
            ));
        }
        Ok(())
    }

    fn saved_commodity_id(&self) -> Result<Id> {
        self.data
            .borrow()
            .commodity
            .as_ref()
            .and_then(|commodity| commodity.base().id())
            .ok_or_else(|| {
                Error::object(
                    ObjectErrorKind::Incomplete,
                    TABLE,
                    "a saved commodity is required before saving",
                )
            })
    }

    fn row_values(&self) -> Result<Vec<Value>> {
        let commodity_id = self.saved_commodity_id()?;
        let data = self.data.borrow();
        let account_type = field::require(data.account_type.as_ref(), TABLE, "account type")?;
        Ok(vec![
            Value::BigInt(account_type.code()),
            Value::Text(field::require(data.name.as_ref(), TABLE, "name")?),
            Value::Text(data.description.clone().unwrap_or_default()),
            Value::BigInt(commodity_id),
        ])
    }
}

/// Decimal places of amounts in account `account_id`, or `None` if there is
/// no such account.
pub(crate) fn precision_of<C: Connection + ?Sized>(conn: &C, account_id: Id) -> Result<Option<u8>> {
    conn.query_one(
        "select precision from accounts join commodities using(commodity_id) \
         where account_id = ?",
        &[Value::BigInt(account_id)],
    )?
    .map(|row| row.get_as(0))
    .transpose()
}

impl PersistentObject for Account {
    type Database = Ledger;

    fn primary_table_name() -> &'static str {
        TABLE
    }

    fn primary_key_name() -> &'static str {
        "account_id"
    }

    fn new_instance(base: PersistentBase<Ledger>) -> Self {
        Self {
            base,
            data: RefCell::default(),
        }
    }

    fn base(&self) -> &PersistentBase<Ledger> {
        &self.base
    }

    fn identity_map(db: &Ledger) -> &IdentityMap<Self> {
        &db.accounts
    }

    fn do_load(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let row = db
            .connection()
            .query_one(
                "select account_type_id, name, description, commodity_id from accounts \
                 where account_id = ?",
                &[Value::BigInt(id)],
            )?
            .ok_or_else(|| BadIdentifier { table: TABLE, id })?;
        let account_type = AccountType::from_code(row.get_named("account_type_id")?)?;
        let commodity = Handle::<Commodity>::with_id_unchecked(db, row.get_named("commodity_id")?)?;
        let loaded = AccountData {
            name: Some(row.get_named("name")?),
            account_type: Some(account_type),
            description: row.get_named("description")?,
            commodity: Some(commodity),
        };
        let previous = std::mem::replace(&mut *self.data.borrow_mut(), loaded);
        drop(previous);
        Ok(())
    }

    fn do_save_existing(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        self.check_commodity_change(db, id, self.saved_commodity_id()?)?;
        let mut params = self.row_values()?;
        params.push(Value::BigInt(id));
        db.connection().execute(
            "update accounts set account_type_id = ?, name = ?, description = ?, \
             commodity_id = ? where account_id = ?",
            &params,
        )?;
        db.mark_account_balance_stale(id);
        Ok(())
    }

    fn do_save_new(&self, db: &Rc<Ledger>, _prospective_id: Id) -> Result<()> {
        db.connection().insert(
            "insert into accounts(account_type_id, name, description, commodity_id) \
             values(?, ?, ?, ?)",
            &self.row_values()?,
        )?;
        db.mark_balances_stale();
        Ok(())
    }

    fn do_remove(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        db.connection().execute(
            "delete from accounts where account_id = ?",
            &[Value::BigInt(id)],
        )?;
        db.mark_account_balance_stale(id);
        Ok(())
    }

    fn do_ghostify(&self) {
        let previous = std::mem::take(&mut *self.data.borrow_mut());
        drop(previous);
    }
}
