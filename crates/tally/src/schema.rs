//! Table layout of a ledger database.

use tally_core::{Connection, Error, Id, Result, Value};
use tally_sqlite::SqliteConnection;

use crate::account::AccountType;
use crate::config::{DayNumber, LedgerConfig};

const TABLES: &str = "
create table commodities(
    commodity_id integer primary key autoincrement,
    abbreviation text not null unique,
    name text not null unique,
    description text,
    precision integer default 2 not null check(precision between 0 and 18)
);
create table account_types(account_type_id integer primary key);
create table accounts(
    account_id integer primary key autoincrement,
    account_type_id integer not null references account_types,
    name text not null unique,
    description text,
    commodity_id integer not null references commodities
);
create table journals(
    journal_id integer primary key autoincrement,
    comment text
);
create table ordinary_journal_detail(
    journal_id integer primary key references journals,
    date integer not null
);
create table draft_journal_detail(
    journal_id integer primary key references journals,
    name text not null unique
);
create table entries(
    entry_id integer primary key autoincrement,
    journal_id integer not null references journals,
    comment text,
    account_id integer not null references accounts,
    amount integer not null
);
create index entry_account_index on entries(account_id);
create table entity_data(
    creation_date integer not null,
    default_commodity_id integer references commodities
);
";

pub(crate) fn is_initialized(conn: &SqliteConnection) -> Result<bool> {
    Ok(conn
        .query_one(
            "select name from sqlite_master where type = 'table' and name = 'entity_data'",
            &[],
        )?
        .is_some())
}

/// Create every table and the single entity row of a new ledger.
pub(crate) fn create(conn: &SqliteConnection, config: &LedgerConfig, creation_date: DayNumber) -> Result<()> {
    conn.execute_raw(TABLES)?;
    for account_type in AccountType::ALL {
        conn.execute(
            "insert into account_types(account_type_id) values(?)",
            &[Value::BigInt(account_type.code())],
        )?;
    }
    let commodity_id = conn.insert(
        "insert into commodities(abbreviation, name, description, precision) values(?, ?, ?, ?)",
        &[
            Value::from(config.default_commodity.as_str()),
            Value::from(config.default_commodity.as_str()),
            Value::from(""),
            Value::from(config.default_commodity_precision),
        ],
    )?;
    conn.execute(
        "insert into entity_data(creation_date, default_commodity_id) values(?, ?)",
        &[Value::BigInt(creation_date), Value::BigInt(commodity_id)],
    )?;
    tracing::info!(
        path = conn.path(),
        creation_date,
        commodity = %config.default_commodity,
        "created ledger schema"
    );
    Ok(())
}

/// Creation date and default commodity of an existing ledger.
pub(crate) fn entity_data(conn: &SqliteConnection) -> Result<(DayNumber, Id)> {
    let row = conn
        .query_one(
            "select creation_date, default_commodity_id from entity_data",
            &[],
        )?
        .ok_or_else(|| Error::Logic("ledger has no entity data row".into()))?;
    let creation_date: i64 = row.get_named("creation_date")?;
    let commodity_id: Option<i64> = row.get_named("default_commodity_id")?;
    let commodity_id = commodity_id
        .ok_or_else(|| Error::Logic("ledger has no default commodity".into()))?;
    Ok((creation_date, commodity_id))
}
