use tally_core::{
    Connection, DatabaseTransaction, Error, OverflowErrorKind, QueryErrorKind,
    TransactionErrorKind, Value,
};
use tally_sqlite::{SqliteConfig, SqliteConnection};

fn open_with_table() -> SqliteConnection {
    let conn = SqliteConnection::open_memory().expect("open sqlite memory db");
    conn.execute_raw(
        "create table things(thing_id integer primary key autoincrement, name text not null unique)",
    )
    .expect("create table");
    conn
}

fn count(conn: &SqliteConnection) -> i64 {
    let row = conn
        .query_one("select count(*) from things", &[])
        .unwrap()
        .unwrap();
    row.get_as(0).unwrap()
}

#[test]
fn next_auto_key_tracks_sqlite_sequence() {
    let conn = open_with_table();
    assert_eq!(conn.next_auto_key("things").unwrap(), 1);

    let id = conn
        .insert("insert into things(name) values(?)", &[Value::from("a")])
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(conn.next_auto_key("things").unwrap(), 2);

    // Deleting does not give the key back.
    conn.execute("delete from things where thing_id = ?", &[Value::BigInt(1)])
        .unwrap();
    assert_eq!(conn.next_auto_key("things").unwrap(), 2);
}

#[test]
fn next_auto_key_without_sequence_table_is_one() {
    let conn = SqliteConnection::open_memory().unwrap();
    conn.execute_raw("create table plain(id integer primary key)")
        .unwrap();
    assert_eq!(conn.next_auto_key("plain").unwrap(), 1);
}

#[test]
fn next_auto_key_reports_exhausted_key_space() {
    let conn = open_with_table();
    conn.insert(
        "insert into things(thing_id, name) values(?, ?)",
        &[Value::BigInt(i64::MAX), Value::from("last")],
    )
    .unwrap();
    let err = conn.next_auto_key("things").unwrap_err();
    assert_eq!(err.overflow_kind(), Some(OverflowErrorKind::TableSize));
}

#[test]
fn inner_cancel_only_discards_inner_level() {
    let conn = open_with_table();

    conn.begin_transaction().unwrap();
    conn.execute("insert into things(name) values('outer')", &[])
        .unwrap();
    conn.begin_transaction().unwrap();
    assert_eq!(conn.transaction_nesting_level(), 2);
    conn.execute("insert into things(name) values('inner')", &[])
        .unwrap();
    conn.cancel_transaction().unwrap();
    conn.end_transaction().unwrap();

    assert_eq!(conn.transaction_nesting_level(), 0);
    assert_eq!(count(&conn), 1);
}

#[test]
fn outer_cancel_discards_everything() {
    let conn = open_with_table();
    conn.begin_transaction().unwrap();
    conn.begin_transaction().unwrap();
    conn.execute("insert into things(name) values('inner')", &[])
        .unwrap();
    conn.end_transaction().unwrap();
    conn.cancel_transaction().unwrap();
    assert_eq!(count(&conn), 0);
}

#[test]
fn nesting_limit_is_enforced() {
    let conn = SqliteConnection::open(&SqliteConfig::memory().max_transaction_nesting(2)).unwrap();
    conn.begin_transaction().unwrap();
    conn.begin_transaction().unwrap();
    let err = conn.begin_transaction().unwrap_err();
    assert!(err.is_transaction_nesting());
    assert_eq!(conn.transaction_nesting_level(), 2);
    conn.end_transaction().unwrap();
    conn.end_transaction().unwrap();
}

#[test]
fn ending_without_begin_is_an_error() {
    let conn = SqliteConnection::open_memory().unwrap();
    match conn.end_transaction() {
        Err(Error::Transaction(t)) => assert_eq!(t.kind, TransactionErrorKind::NotActive),
        other => panic!("expected NotActive, got {other:?}"),
    }
    assert!(conn.cancel_transaction().is_err());
}

#[test]
fn dropped_guard_rolls_back() {
    let conn = open_with_table();
    {
        let _tx = DatabaseTransaction::begin(&conn).unwrap();
        conn.execute("insert into things(name) values('x')", &[])
            .unwrap();
    }
    assert_eq!(count(&conn), 0);

    let tx = DatabaseTransaction::begin(&conn).unwrap();
    conn.execute("insert into things(name) values('y')", &[])
        .unwrap();
    tx.commit().unwrap();
    assert_eq!(count(&conn), 1);
}

#[test]
fn closed_connection_is_invalid() {
    let conn = open_with_table();
    assert!(conn.is_valid());
    conn.close().unwrap();
    assert!(!conn.is_valid());

    let err = conn.query("select 1", &[]).unwrap_err();
    assert!(err.is_invalid_connection());
    assert!(conn.begin_transaction().unwrap_err().is_invalid_connection());
    assert!(conn.end_transaction().unwrap_err().is_invalid_connection());
}

#[test]
fn close_inside_transaction_resets_nesting() {
    let conn = open_with_table();
    conn.begin_transaction().unwrap();
    conn.close().unwrap();
    assert_eq!(conn.transaction_nesting_level(), 0);
}

#[test]
fn statements_are_cached_up_to_capacity() {
    let conn = SqliteConnection::open(&SqliteConfig::memory().statement_cache_capacity(1)).unwrap();
    conn.query("select 1", &[]).unwrap();
    conn.query("select 1", &[]).unwrap();
    assert_eq!(conn.cached_statement_count(), 1);
    conn.query("select 2", &[]).unwrap();
    assert_eq!(conn.cached_statement_count(), 1);

    let uncached = SqliteConnection::open(&SqliteConfig::memory().statement_cache_capacity(0)).unwrap();
    uncached.query("select 1", &[]).unwrap();
    assert_eq!(uncached.cached_statement_count(), 0);
}

#[test]
fn prepared_statements_bind_and_check_arity() {
    let conn = open_with_table();
    let insert = conn.prepare("insert into things(name) values(?)").unwrap();
    assert_eq!(insert.param_count(), 1);
    conn.execute_prepared(&insert, &[Value::from("a")]).unwrap();
    conn.execute_prepared(&insert, &[Value::from("b")]).unwrap();
    assert!(conn.execute_prepared(&insert, &[]).is_err());

    let select = conn
        .prepare("select name from things order by thing_id")
        .unwrap();
    assert_eq!(select.columns(), ["name".to_string()]);
    let names: Vec<String> = conn
        .query_prepared(&select, &[])
        .unwrap()
        .iter()
        .map(|r| r.get_named("name").unwrap())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn constraint_violations_are_classified() {
    let conn = open_with_table();
    conn.execute("insert into things(name) values('dup')", &[])
        .unwrap();
    match conn.execute("insert into things(name) values('dup')", &[]) {
        Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::Constraint),
        other => panic!("expected constraint error, got {other:?}"),
    }
    match conn.query("select * from missing", &[]) {
        Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::NotFound),
        other => panic!("expected not-found error, got {other:?}"),
    }
}

#[test]
fn foreign_keys_are_enforced_by_default() {
    let conn = SqliteConnection::open_memory().unwrap();
    conn.execute_raw(
        "create table parents(parent_id integer primary key);
         create table children(child_id integer primary key,
             parent_id integer not null references parents);",
    )
    .unwrap();
    let err = conn
        .execute("insert into children(parent_id) values(5)", &[])
        .unwrap_err();
    assert!(matches!(err, Error::Query(_)));
}
