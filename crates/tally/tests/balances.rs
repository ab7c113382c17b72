use std::rc::Rc;

use tally::{
    Account, AccountType, Commodity, Decimal, Entry, Journal, JournalKind, Ledger, LedgerConfig,
    RefreshStrategy,
};
use tally_core::{Connection, Error, ObjectErrorKind, OverflowErrorKind, Value};
use tally_session::{Database, Handle, PersistentObject};

const CREATED: i64 = 20_000;

fn open() -> Rc<Ledger> {
    Ledger::open(LedgerConfig::memory().creation_date(CREATED)).unwrap()
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn account(ledger: &Rc<Ledger>, name: &str) -> Handle<Account> {
    let a = Handle::<Account>::new(ledger).unwrap();
    a.set_name(name).unwrap();
    a.set_account_type(AccountType::Asset).unwrap();
    a.set_commodity(&ledger.default_commodity().unwrap()).unwrap();
    a.save().unwrap();
    a
}

fn commodity(ledger: &Rc<Ledger>, abbreviation: &str, precision: u8) -> Handle<Commodity> {
    let c = Handle::<Commodity>::new(ledger).unwrap();
    c.set_abbreviation(abbreviation).unwrap();
    c.set_name(abbreviation).unwrap();
    c.set_precision(precision).unwrap();
    c.save().unwrap();
    c
}

fn journal(ledger: &Rc<Ledger>, kind: JournalKind) -> Handle<Journal> {
    let j = Handle::<Journal>::new(ledger).unwrap();
    j.set_kind(kind).unwrap();
    j.save().unwrap();
    j
}

fn ordinary(ledger: &Rc<Ledger>) -> Handle<Journal> {
    journal(ledger, JournalKind::Ordinary { date: CREATED })
}

fn post(
    ledger: &Rc<Ledger>,
    journal: &Handle<Journal>,
    account: &Handle<Account>,
    amount: &str,
) -> Handle<Entry> {
    let e = Handle::<Entry>::new(ledger).unwrap();
    e.set_journal(journal).unwrap();
    e.set_account(account).unwrap();
    e.set_amount(dec(amount)).unwrap();
    e.save().unwrap();
    e
}

/// Sum of ordinary entries straight from the store, in raw units.
fn stored_sum(ledger: &Ledger, account: &Handle<Account>) -> i64 {
    ledger
        .connection()
        .query_one(
            "select coalesce(sum(amount), 0) from entries \
             join ordinary_journal_detail using(journal_id) where account_id = ?",
            &[Value::BigInt(account.id().unwrap())],
        )
        .unwrap()
        .unwrap()
        .get_as(0)
        .unwrap()
}

/// `n` accounts with one entry each, and a cache that is fully fresh.
fn populated(n: usize) -> (Rc<Ledger>, Vec<Handle<Account>>, Vec<Handle<Entry>>) {
    let ledger = open();
    let j = ordinary(&ledger);
    let accounts: Vec<_> = (0..n).map(|i| account(&ledger, &format!("acct {i}"))).collect();
    let entries: Vec<_> = accounts.iter().map(|a| post(&ledger, &j, a, "1.00")).collect();
    assert_eq!(ledger.refresh_balances().unwrap(), RefreshStrategy::Full);
    (ledger, accounts, entries)
}

fn bump(entries: &[Handle<Entry>]) {
    for e in entries {
        e.set_amount(dec("2.00")).unwrap();
        e.save().unwrap();
    }
}

#[test]
fn balance_sums_entries_at_commodity_precision() {
    let ledger = open();
    let cash = account(&ledger, "Cash");
    let j = ordinary(&ledger);
    post(&ledger, &j, &cash, "100.00");
    post(&ledger, &j, &cash, "50.25");

    let balance = cash.technical_balance().unwrap();
    assert_eq!(balance, dec("150.25"));
    assert_eq!(balance.places(), 2);
    assert_eq!(balance.to_string(), "150.25");
}

#[test]
fn fulcrum_minus_one_stale_accounts_refresh_targeted() {
    let (ledger, accounts, entries) = populated(6);
    bump(&entries[..4]);

    let before = ledger.balance_cache_stats();
    assert_eq!(ledger.refresh_balances().unwrap(), RefreshStrategy::Targeted);
    let after = ledger.balance_cache_stats();
    assert_eq!(after.targeted_refreshes, before.targeted_refreshes + 1);
    assert_eq!(after.targeted_queries, before.targeted_queries + 4);
    assert_eq!(after.full_refreshes, before.full_refreshes);

    for a in &accounts[..4] {
        assert_eq!(a.technical_balance().unwrap(), dec("2.00"));
    }
    assert_eq!(accounts[5].technical_balance().unwrap(), dec("1.00"));
}

#[test]
fn fulcrum_stale_accounts_refresh_all() {
    let (ledger, _accounts, entries) = populated(6);
    bump(&entries[..5]);

    let before = ledger.balance_cache_stats();
    assert_eq!(ledger.refresh_balances().unwrap(), RefreshStrategy::Full);
    let after = ledger.balance_cache_stats();
    assert_eq!(after.full_refreshes, before.full_refreshes + 1);
    assert_eq!(after.targeted_queries, before.targeted_queries);
}

#[test]
fn six_stale_accounts_take_one_full_pass() {
    let (ledger, accounts, entries) = populated(6);
    bump(&entries);

    let before = ledger.balance_cache_stats();
    assert_eq!(accounts[0].technical_balance().unwrap(), dec("2.00"));
    let after = ledger.balance_cache_stats();
    assert_eq!(after.full_refreshes, before.full_refreshes + 1);
    assert_eq!(after.targeted_refreshes, before.targeted_refreshes);
    assert_eq!(after.targeted_queries, before.targeted_queries);

    // Everything is fresh now; no further refresh.
    for a in &accounts {
        assert_eq!(a.technical_balance().unwrap(), dec("2.00"));
    }
    assert_eq!(ledger.balance_cache_stats(), after);
}

#[test]
fn fresh_balances_are_served_without_refreshing() {
    let (ledger, accounts, _entries) = populated(2);
    let stats = ledger.balance_cache_stats();
    assert_eq!(accounts[0].technical_balance().unwrap(), dec("1.00"));
    assert_eq!(accounts[1].technical_balance().unwrap(), dec("1.00"));
    assert_eq!(ledger.balance_cache_stats(), stats);
}

#[test]
fn balance_tracks_insert_update_delete_and_moves() {
    let ledger = open();
    let a = account(&ledger, "A");
    let b = account(&ledger, "B");
    let j = ordinary(&ledger);
    let check = |acct: &Handle<Account>| {
        let balance = acct.technical_balance().unwrap();
        assert_eq!(balance.intval(), stored_sum(&ledger, acct));
    };

    let e1 = post(&ledger, &j, &a, "10.00");
    check(&a);
    let e2 = post(&ledger, &j, &a, "-3.50");
    check(&a);
    assert_eq!(a.technical_balance().unwrap(), dec("6.50"));

    e1.set_amount(dec("20")).unwrap();
    e1.save().unwrap();
    check(&a);
    assert_eq!(a.technical_balance().unwrap(), dec("16.50"));

    // Moving an entry changes both accounts.
    e2.set_account(&b).unwrap();
    e2.save().unwrap();
    check(&a);
    check(&b);
    assert_eq!(a.technical_balance().unwrap(), dec("20.00"));
    assert_eq!(b.technical_balance().unwrap(), dec("-3.50"));

    e1.remove().unwrap();
    check(&a);
    assert_eq!(a.technical_balance().unwrap(), dec("0.00"));
    assert!(!e1.has_id());
}

#[test]
fn draft_entries_do_not_count() {
    let ledger = open();
    let a = account(&ledger, "A");
    let posted = ordinary(&ledger);
    let draft = journal(
        &ledger,
        JournalKind::Draft {
            name: "next month".into(),
        },
    );
    post(&ledger, &posted, &a, "5.00");
    post(&ledger, &draft, &a, "7.00");
    assert_eq!(a.technical_balance().unwrap(), dec("5.00"));

    // Posting the draft brings its entries in.
    draft
        .set_kind(JournalKind::Ordinary { date: CREATED + 3 })
        .unwrap();
    draft.save().unwrap();
    assert_eq!(a.technical_balance().unwrap(), dec("12.00"));
}

#[test]
fn removing_a_journal_removes_its_entries() {
    let ledger = open();
    let a = account(&ledger, "A");
    let keep = ordinary(&ledger);
    let doomed = ordinary(&ledger);
    post(&ledger, &keep, &a, "1.00");
    let e = post(&ledger, &doomed, &a, "4.00");
    assert_eq!(a.technical_balance().unwrap(), dec("5.00"));
    assert_eq!(doomed.entries().unwrap().len(), 1);

    doomed.remove().unwrap();
    assert!(!e.has_id());
    assert_eq!(a.technical_balance().unwrap(), dec("1.00"));
    assert_eq!(stored_sum(&ledger, &a), 100);
}

#[test]
fn deleted_account_is_pruned_by_targeted_refresh() {
    let (ledger, accounts, _entries) = populated(3);
    let spare = account(&ledger, "spare");
    let spare_id = spare.id().unwrap();
    assert_eq!(spare.technical_balance().unwrap(), dec("0.00"));

    spare.remove().unwrap();
    assert_eq!(ledger.refresh_balances().unwrap(), RefreshStrategy::Targeted);
    assert!(ledger.technical_balance(spare_id).unwrap_err().is_bad_identifier());
    assert_eq!(accounts[0].technical_balance().unwrap(), dec("1.00"));
}

#[test]
fn deleted_account_is_pruned_by_full_refresh() {
    let (ledger, _accounts, _entries) = populated(3);
    let spare = account(&ledger, "spare");
    let spare_id = spare.id().unwrap();
    assert_eq!(spare.technical_balance().unwrap(), dec("0.00"));

    spare.remove().unwrap();
    ledger.mark_balances_stale();
    assert_eq!(ledger.refresh_balances().unwrap(), RefreshStrategy::Full);
    assert!(ledger.technical_balance(spare_id).unwrap_err().is_bad_identifier());
}

#[test]
fn account_with_entries_cannot_be_removed() {
    let ledger = open();
    let a = account(&ledger, "A");
    let j = ordinary(&ledger);
    post(&ledger, &j, &a, "1.00");
    assert!(matches!(a.remove(), Err(Error::Query(_))));
    assert!(a.has_id());
    assert_eq!(a.technical_balance().unwrap(), dec("1.00"));
}

#[test]
fn unknown_account_is_a_bad_identifier() {
    let ledger = open();
    assert!(ledger.technical_balance(999).unwrap_err().is_bad_identifier());
    assert!(
        ledger
            .technical_opening_balance(999)
            .unwrap_err()
            .is_bad_identifier()
    );
}

#[test]
fn opening_balance_counts_only_the_opening_date() {
    let ledger = open();
    let a = account(&ledger, "A");
    let opening = journal(
        &ledger,
        JournalKind::Ordinary {
            date: ledger.opening_balance_date(),
        },
    );
    let later = ordinary(&ledger);
    post(&ledger, &opening, &a, "1000.00");
    post(&ledger, &later, &a, "5.00");

    assert_eq!(a.technical_opening_balance().unwrap(), dec("1000.00"));
    assert_eq!(a.technical_balance().unwrap(), dec("1005.00"));

    let b = account(&ledger, "B");
    assert_eq!(b.technical_opening_balance().unwrap(), dec("0.00"));
}

#[test]
fn full_refresh_reports_overflow() {
    let ledger = open();
    let a = account(&ledger, "A");
    let j = ordinary(&ledger);
    let half = i64::MAX / 2 + 1;
    for _ in 0..2 {
        let e = Handle::<Entry>::new(&ledger).unwrap();
        e.set_journal(&j).unwrap();
        e.set_account(&a).unwrap();
        e.set_amount(Decimal::new(half, 2)).unwrap();
        e.save().unwrap();
    }
    ledger.mark_balances_stale();
    let err = a.technical_balance().unwrap_err();
    assert_eq!(err.overflow_kind(), Some(OverflowErrorKind::Arithmetic));
}

#[test]
fn amounts_are_stored_at_account_precision() {
    let ledger = open();
    let a = account(&ledger, "A");
    let j = ordinary(&ledger);
    let e = post(&ledger, &j, &a, "1.5");
    assert_eq!(e.amount().unwrap().places(), 2);
    assert_eq!(stored_sum(&ledger, &a), 150);

    e.ghostify();
    assert_eq!(e.amount().unwrap().to_string(), "1.50");
}

#[test]
fn precision_is_fixed_once_entries_use_the_commodity() {
    let ledger = open();
    let cash = account(&ledger, "Cash");
    let j = ordinary(&ledger);
    let e = post(&ledger, &j, &cash, "150.25");
    let dollars = ledger.default_commodity().unwrap();

    dollars.set_precision(3).unwrap();
    let err = dollars.save().unwrap_err();
    assert_eq!(err.object_kind(), Some(ObjectErrorKind::Conflict));
    assert_eq!(ledger.connection().transaction_nesting_level(), 0);

    dollars.ghostify();
    assert_eq!(dollars.precision().unwrap(), 2);
    assert_eq!(cash.technical_balance().unwrap(), dec("150.25"));
    e.ghostify();
    assert_eq!(e.amount().unwrap(), dec("150.25"));
    assert_eq!(e.amount().unwrap().places(), 2);

    // Other fields can still change.
    dollars.set_description("US dollars").unwrap();
    dollars.save().unwrap();
}

#[test]
fn precision_of_an_unused_commodity_can_change() {
    let ledger = open();
    let cash = account(&ledger, "Cash");
    let dollars = ledger.default_commodity().unwrap();
    dollars.set_precision(3).unwrap();
    dollars.save().unwrap();
    assert_eq!(cash.technical_balance().unwrap().places(), 3);

    let j = ordinary(&ledger);
    let e = post(&ledger, &j, &cash, "1.5");
    assert_eq!(e.amount().unwrap().to_string(), "1.500");
}

#[test]
fn account_with_entries_keeps_its_precision() {
    let ledger = open();
    let cash = account(&ledger, "Cash");
    let j = ordinary(&ledger);
    post(&ledger, &j, &cash, "150.25");
    let yen = commodity(&ledger, "JPY", 0);
    let euro = commodity(&ledger, "EUR", 2);

    cash.set_commodity(&yen).unwrap();
    let err = cash.save().unwrap_err();
    assert_eq!(err.object_kind(), Some(ObjectErrorKind::Conflict));
    assert_eq!(cash.technical_balance().unwrap(), dec("150.25"));
    assert_eq!(stored_sum(&ledger, &cash), 15025);

    cash.set_commodity(&euro).unwrap();
    cash.save().unwrap();
    assert_eq!(cash.technical_balance().unwrap(), dec("150.25"));

    let spare = account(&ledger, "Spare");
    spare.set_commodity(&yen).unwrap();
    spare.save().unwrap();
    assert_eq!(spare.technical_balance().unwrap().places(), 0);
}

#[test]
fn store_rejects_precision_beyond_eighteen() {
    let ledger = open();
    assert!(
        ledger
            .connection()
            .execute("update commodities set precision = 19", &[])
            .is_err()
    );
    assert_eq!(ledger.default_commodity().unwrap().precision().unwrap(), 2);
}

#[test]
fn refresh_needs_its_own_transaction_level() {
    let mut config = LedgerConfig::memory().creation_date(CREATED);
    config.max_transaction_nesting = 1;
    let ledger = Ledger::open(config).unwrap();
    let cash = account(&ledger, "Cash");
    let j = ordinary(&ledger);
    post(&ledger, &j, &cash, "10.00");
    assert_eq!(cash.technical_balance().unwrap(), dec("10.00"));
    post(&ledger, &j, &cash, "5.00");

    let stats = ledger.balance_cache_stats();
    ledger.connection().begin_transaction().unwrap();
    assert!(ledger.refresh_balances().unwrap_err().is_transaction_nesting());
    assert!(cash.technical_balance().unwrap_err().is_transaction_nesting());
    assert!(cash.technical_opening_balance().unwrap_err().is_transaction_nesting());
    assert_eq!(ledger.balance_cache_stats(), stats);
    ledger.connection().end_transaction().unwrap();

    assert_eq!(cash.technical_balance().unwrap(), dec("15.00"));
    assert_eq!(ledger.balance_cache_stats().targeted_refreshes, stats.targeted_refreshes + 1);
}

#[test]
fn failed_journal_removal_keeps_its_entries() {
    let ledger = open();
    let a = account(&ledger, "A");
    let j = ordinary(&ledger);
    let e = post(&ledger, &j, &a, "4.00");
    ledger
        .connection()
        .execute_raw(
            "create trigger keep_journals before delete on journals \
             begin select raise(abort, 'journal is locked'); end",
        )
        .unwrap();

    assert!(j.remove().is_err());
    assert!(j.has_id());
    assert!(e.has_id());
    assert_eq!(ledger.connection().transaction_nesting_level(), 0);
    assert_eq!(stored_sum(&ledger, &a), 400);
    assert_eq!(a.technical_balance().unwrap(), dec("4.00"));

    // The surviving entry updates its row instead of inserting another.
    e.set_amount(dec("5.00")).unwrap();
    e.save().unwrap();
    assert_eq!(stored_sum(&ledger, &a), 500);
    assert_eq!(j.entries().unwrap().len(), 1);

    ledger.connection().execute_raw("drop trigger keep_journals").unwrap();
    j.remove().unwrap();
    assert!(!e.has_id());
    assert_eq!(stored_sum(&ledger, &a), 0);
    assert_eq!(a.technical_balance().unwrap(), dec("0.00"));
}
