//! Commodities: the units amounts are denominated in.

use std::cell::RefCell;
use std::rc::Rc;

use tally_core::{BadIdentifier, Connection, Error, Id, ObjectErrorKind, Result, Value};
use tally_session::{Database, IdentityMap, PersistentBase, PersistentObject};

use crate::decimal::Decimal;
use crate::field;
use crate::ledger::Ledger;

const TABLE: &str = "commodities";

#[derive(Default)]
struct CommodityData {
    abbreviation: Option<String>,
    name: Option<String>,
    description: Option<String>,
    precision: Option<u8>,
}

/// A currency or other unit. Its precision fixes the number of decimal
/// places of every amount in accounts that use it.
pub struct Commodity {
    base: PersistentBase<Ledger>,
    data: RefCell<CommodityData>,
}

impl Commodity {
    pub fn abbreviation(&self) -> Result<String> {
        self.load()?;
        field::get(self.data.borrow().abbreviation.as_ref(), TABLE, "abbreviation")
    }

    pub fn name(&self) -> Result<String> {
        self.load()?;
        field::get(self.data.borrow().name.as_ref(), TABLE, "name")
    }

    pub fn description(&self) -> Result<String> {
        self.load()?;
        Ok(self.data.borrow().description.clone().unwrap_or_default())
    }

    pub fn precision(&self) -> Result<u8> {
        self.load()?;
        field::get(self.data.borrow().precision.as_ref(), TABLE, "precision")
    }

    pub fn set_abbreviation(&self, abbreviation: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().abbreviation = Some(abbreviation.to_string());
        Ok(())
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().name = Some(name.to_string());
        Ok(())
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.load()?;
        self.data.borrow_mut().description = Some(description.to_string());
        Ok(())
    }

    pub fn set_precision(&self, precision: u8) -> Result<()> {
        if precision > Decimal::MAX_PLACES {
            return Err(Error::Logic(format!(
                "commodity precision {} exceeds {}",
                precision,
                Decimal::MAX_PLACES
            )));
        }
        self.load()?;
        self.data.borrow_mut().precision = Some(precision);
        Ok(())
    }

    /// Id of the commodity with this abbreviation, if any.
    pub fn id_for_abbreviation(ledger: &Ledger, abbreviation: &str) -> Result<Option<Id>> {
        ledger
            .connection()
            .query_one(
                "select commodity_id from commodities where abbreviation = ?",
                &[Value::from(abbreviation)],
            )?
            .map(|row| row.get_as(0))
            .transpose()
    }

    /// Entry amounts are stored as integers at their commodity's precision,
    /// so the precision is fixed once any entry uses the commodity.
    fn check_precision_change(&self, db: &Ledger, id: Id) -> Result<()> {
        let Some(precision) = self.data.borrow().precision else {
            return Ok(());
        };
        let conn = db.connection();
        let stored: Option<u8> = conn
            .query_one(
                "select precision from commodities where commodity_id = ?",
                &[Value::BigInt(id)],
            )?
            .map(|row| row.get_as(0))
            .transpose()?;
        if stored.is_none_or(|stored| stored == precision) {
            return Ok(());
        }
        let in_use = conn
            .query_one(
                "select entry_id from entries join accounts using(account_id) \
                 where commodity_id = ? limit 1",
                &[Value::BigInt(id)],
            )?
            .is_some();
        if in_use {
            return Err(Error::object(
                ObjectErrorKind::Conflict,
                TABLE,
                format!("precision of commodity {} cannot change while entries use it", id),
            ));
        }
        Ok(())
    }

    fn row_values(&self) -> Result<Vec<Value>> {
        let data = self.data.borrow();
        Ok(vec![
            Value::Text(field::require(data.abbreviation.as_ref(), TABLE, "abbreviation")?),
            Value::Text(field::require(data.name.as_ref(), TABLE, "name")?),
            Value::Text(data.description.clone().unwrap_or_default()),
            Value::from(field::require(data.precision.as_ref(), TABLE, "precision")?),
        ])
    }
}

impl PersistentObject for Commodity {
    type Database = Ledger;

    fn primary_table_name() -> &'static str {
        TABLE
    }

    fn primary_key_name() -> &'static str {
        "commodity_id"
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
        &db.commodities
    }

    fn do_load(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        let row = db
            .connection()
            .query_one(
                "select abbreviation, name, description, precision from commodities \
                 where commodity_id = ?",
                &[Value::BigInt(id)],
            )?
            .ok_or_else(|| BadIdentifier { table: TABLE, id })?;
        let mut data = self.data.borrow_mut();
        data.abbreviation = Some(row.get_named("abbreviation")?);
        data.name = Some(row.get_named("name")?);
        data.description = row.get_named("description")?;
        data.precision = Some(row.get_named("precision")?);
        Ok(())
    }

    fn do_save_existing(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        self.check_precision_change(db, id)?;
        let mut params = self.row_values()?;
        params.push(Value::BigInt(id));
        db.connection().execute(
            "update commodities set abbreviation = ?, name = ?, description = ?, precision = ? \
             where commodity_id = ?",
            &params,
        )?;
        db.mark_balances_stale();
        Ok(())
    }

    fn do_save_new(&self, db: &Rc<Ledger>, _prospective_id: Id) -> Result<()> {
        db.connection().insert(
            "insert into commodities(abbreviation, name, description, precision) \
             values(?, ?, ?, ?)",
            &self.row_values()?,
        )?;
        db.mark_balances_stale();
        Ok(())
    }

    fn do_remove(&self, db: &Rc<Ledger>, id: Id) -> Result<()> {
        db.connection().execute(
            "delete from commodities where commodity_id = ?",
            &[Value::BigInt(id)],
        )?;
        db.mark_balances_stale();
        Ok(())
    }

    fn do_ghostify(&self) {
        *self.data.borrow_mut() = CommodityData::default();
    }
}
