//! The application connection.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tally_core::{Connection, DatabaseTransaction, Id, Result};
use tally_session::{Database, Handle, IdentityMap, PersistentObject};
use tally_sqlite::SqliteConnection;

use crate::account::{Account, AccountType};
use crate::balance_cache::{BalanceCache, BalanceCacheStats, RefreshStrategy};
use crate::commodity::Commodity;
use crate::config::{self, CachingLevel, DayNumber, LedgerConfig};
use crate::decimal::Decimal;
use crate::entry::Entry;
use crate::journal::Journal;
use crate::schema;
use crate::suggestions::AccountSuggestions;

/// One open ledger database: the SQLite connection, an identity map per
/// entity type and the balance cache.
///
/// Always held in an `Rc`; entities keep a weak reference back to it.
pub struct Ledger {
    conn: SqliteConnection,
    config: LedgerConfig,
    caching: Cell<CachingLevel>,
    creation_date: DayNumber,
    default_commodity_id: Id,
    balance_cache: RefCell<BalanceCache>,
    pub(crate) commodities: IdentityMap<Commodity>,
    pub(crate) accounts: IdentityMap<Account>,
    pub(crate) journals: IdentityMap<Journal>,
    pub(crate) entries: IdentityMap<Entry>,
}

impl Database for Ledger {
    type Conn = SqliteConnection;

    fn connection(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.conn.path())
            .field("creation_date", &self.creation_date)
            .field("caching", &self.caching.get())
            .field("balance_cache", &self.balance_cache.borrow().stats())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open the ledger at `config.path`, creating its tables on first use.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %config.path))]
    pub fn open(config: LedgerConfig) -> Result<Rc<Self>> {
        config.validate()?;
        let conn = SqliteConnection::open(&config.sqlite_config())?;
        if !schema::is_initialized(&conn)? {
            let creation_date = config.creation_date.unwrap_or_else(config::today);
            let tx = DatabaseTransaction::begin(&conn)?;
            schema::create(&conn, &config, creation_date)?;
            tx.commit()?;
        }
        let (creation_date, default_commodity_id) = schema::entity_data(&conn)?;

        let ledger = Rc::new(Self {
            conn,
            caching: Cell::new(config.caching),
            creation_date,
            default_commodity_id,
            balance_cache: RefCell::new(BalanceCache::new(config.balance_fulcrum)),
            commodities: IdentityMap::new(),
            accounts: IdentityMap::new(),
            journals: IdentityMap::new(),
            entries: IdentityMap::new(),
            config,
        });
        ledger.apply_caching_level(ledger.config.caching);
        tracing::debug!(creation_date, default_commodity_id, "opened ledger");
        Ok(ledger)
    }

    /// An in-memory ledger with default settings.
    pub fn open_memory() -> Result<Rc<Self>> {
        Self::open(LedgerConfig::memory())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn creation_date(&self) -> DayNumber {
        self.creation_date
    }

    /// The day before the creation date. Entries on this date are opening
    /// balances.
    pub fn opening_balance_date(&self) -> DayNumber {
        self.creation_date - 1
    }

    pub fn default_commodity(self: &Rc<Self>) -> Result<Handle<Commodity>> {
        Handle::with_id(self, self.default_commodity_id)
    }

    /// The identity map holding this ledger's objects of type `T`.
    pub fn identity_map<T>(&self) -> &IdentityMap<T>
    where
        T: PersistentObject<Database = Ledger>,
    {
        T::identity_map(self)
    }

    pub fn technical_balance(&self, account_id: Id) -> Result<Decimal> {
        self.balance_cache
            .borrow_mut()
            .technical_balance(&self.conn, account_id)
    }

    pub fn technical_opening_balance(&self, account_id: Id) -> Result<Decimal> {
        self.balance_cache.borrow().technical_opening_balance(
            &self.conn,
            account_id,
            self.opening_balance_date(),
        )
    }

    pub fn mark_balances_stale(&self) {
        self.balance_cache.borrow_mut().mark_as_stale();
    }

    pub fn mark_account_balance_stale(&self, account_id: Id) {
        self.balance_cache.borrow_mut().mark_account_stale(account_id);
    }

    /// Refresh the balance cache now rather than on the next balance
    /// request.
    pub fn refresh_balances(&self) -> Result<RefreshStrategy> {
        self.balance_cache.borrow_mut().refresh(&self.conn)
    }

    pub fn balance_cache_stats(&self) -> BalanceCacheStats {
        self.balance_cache.borrow().stats()
    }

    /// Choose which entity types keep orphaned objects in memory. Lowering
    /// the level releases the objects no one holds a handle to.
    pub fn set_caching_level(&self, level: CachingLevel) {
        self.caching.set(level);
        self.apply_caching_level(level);
        tracing::debug!(?level, "caching level changed");
    }

    pub fn caching_level(&self) -> CachingLevel {
        self.caching.get()
    }

    fn apply_caching_level(&self, level: CachingLevel) {
        let accounts = level != CachingLevel::Minimal;
        let everything = level == CachingLevel::Full;
        set_caching(&self.commodities, accounts);
        set_caching(&self.accounts, accounts);
        set_caching(&self.journals, everything);
        set_caching(&self.entries, everything);
    }

    /// Unsaved accounts of `account_type` built from `suggestions`, in the
    /// ledger's default commodity. Saving them is up to the caller.
    pub fn suggested_accounts(
        self: &Rc<Self>,
        suggestions: &AccountSuggestions,
        account_type: AccountType,
    ) -> Result<Vec<Handle<Account>>> {
        let commodity = self.default_commodity()?;
        suggestions
            .for_type(account_type)
            .map(|suggestion| {
                let account = Handle::<Account>::new(self)?;
                account.set_name(&suggestion.name)?;
                account.set_account_type(suggestion.account_type)?;
                account.set_description(&suggestion.description)?;
                account.set_commodity(&commodity)?;
                Ok(account)
            })
            .collect()
    }

    /// Ids of every account, in Id order.
    pub fn account_ids(&self) -> Result<Vec<Id>> {
        self.conn
            .query("select account_id from accounts order by account_id", &[])?
            .iter()
            .map(|row| row.get_as(0))
            .collect()
    }
}

fn set_caching<T: PersistentObject>(map: &IdentityMap<T>, enabled: bool) {
    if enabled {
        map.enable_caching();
    } else {
        map.disable_caching();
    }
}
