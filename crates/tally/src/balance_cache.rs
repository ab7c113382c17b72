//! Per-account running balances kept in step with the entries table.
//!
//! The cache maps every account Id to its balance, or to `None` once the
//! account has been marked stale. The whole map can be marked stale as well,
//! which is what happens when an account is added.
//!
//! A refresh either rebuilds every balance in one pass over the ordinary
//! entries or re-sums only the stale accounts, one query each. The rebuild
//! costs about the same however many accounts are stale, so once the scan
//! for stale accounts reaches the fulcrum the rebuild is used.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tally_core::{
    BadIdentifier, Connection, DatabaseTransaction, Error, Id, OverflowErrorKind, Result, Value,
};

use crate::account;
use crate::config::{DEFAULT_BALANCE_FULCRUM, DayNumber};
use crate::decimal::Decimal;

/// How a refresh brought the cache up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshStrategy {
    /// Every balance recomputed in one pass over the entries.
    Full,
    /// Only the stale accounts re-summed.
    Targeted,
}

/// Counters describing the work the cache has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalanceCacheStats {
    pub full_refreshes: u64,
    pub targeted_refreshes: u64,
    /// Per-account sum queries issued by targeted refreshes.
    pub targeted_queries: u64,
}

#[derive(Debug)]
pub struct BalanceCache {
    map: HashMap<Id, Option<Decimal>>,
    map_is_stale: bool,
    fulcrum: usize,
    stats: BalanceCacheStats,
}

impl Default for BalanceCache {
    fn default() -> Self {
        Self::new(DEFAULT_BALANCE_FULCRUM)
    }
}

impl BalanceCache {
    /// An empty cache. It starts stale, so the first balance request
    /// rebuilds it.
    pub fn new(fulcrum: usize) -> Self {
        Self {
            map: HashMap::new(),
            map_is_stale: true,
            fulcrum: fulcrum.max(1),
            stats: BalanceCacheStats::default(),
        }
    }

    pub fn fulcrum(&self) -> usize {
        self.fulcrum
    }

    pub fn stats(&self) -> BalanceCacheStats {
        self.stats
    }

    pub fn is_stale(&self) -> bool {
        self.map_is_stale
    }

    /// Whether `account_id` has a fresh balance in the cache.
    pub fn is_fresh(&self, account_id: Id) -> bool {
        !self.map_is_stale && matches!(self.map.get(&account_id), Some(Some(_)))
    }

    /// Number of accounts the cache holds an entry for, fresh or stale.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Balance of `account_id`, refreshing first if it is not fresh.
    pub fn technical_balance<C>(&mut self, conn: &C, account_id: Id) -> Result<Decimal>
    where
        C: Connection + ?Sized,
    {
        if !self.is_fresh(account_id) {
            self.refresh(conn)?;
        }
        match self.map.get(&account_id) {
            Some(Some(balance)) => Ok(*balance),
            _ => Err(Error::BadIdentifier(BadIdentifier {
                table: "accounts",
                id: account_id,
            })),
        }
    }

    /// Sum of the entries of `account_id` in ordinary journals dated
    /// `opening_date`. Not cached. Both reads share one transaction.
    pub fn technical_opening_balance<C>(
        &self,
        conn: &C,
        account_id: Id,
        opening_date: DayNumber,
    ) -> Result<Decimal>
    where
        C: Connection + ?Sized,
    {
        let tx = DatabaseTransaction::begin(conn)?;
        let places = account::precision_of(conn, account_id)?.ok_or(BadIdentifier {
            table: "accounts",
            id: account_id,
        })?;
        let sum: Option<i64> = conn
            .query_one(
                "select sum(amount) from ordinary_journal_detail \
                 join entries using(journal_id) where date = ? and account_id = ?",
                &[Value::BigInt(opening_date), Value::BigInt(account_id)],
            )?
            .map(|row| row.get_as(0))
            .transpose()?
            .flatten();
        tx.commit()?;
        Decimal::try_new(sum.unwrap_or(0), places)
    }

    /// Mark every balance stale.
    pub fn mark_as_stale(&mut self) {
        self.map_is_stale = true;
    }

    /// Mark one balance stale. An account the cache has never seen makes
    /// the whole map stale.
    pub fn mark_account_stale(&mut self, account_id: Id) {
        match self.map.get_mut(&account_id) {
            Some(entry) => *entry = None,
            None => self.map_is_stale = true,
        }
    }

    /// Bring every balance up to date, choosing the cheaper strategy.
    ///
    /// Every read of one refresh runs in a single transaction. On failure
    /// the cache is left as it was, stale balances included.
    #[tracing::instrument(level = "debug", skip_all, fields(fulcrum = self.fulcrum))]
    pub fn refresh<C>(&mut self, conn: &C) -> Result<RefreshStrategy>
    where
        C: Connection + ?Sized,
    {
        let tx = DatabaseTransaction::begin(conn)?;
        let strategy = if self.map_is_stale {
            self.refresh_all(conn)?;
            RefreshStrategy::Full
        } else {
            let stale = self.scan_stale(conn)?;
            if stale.len() == self.fulcrum {
                self.refresh_all(conn)?;
                RefreshStrategy::Full
            } else {
                self.refresh_targetted(conn, &stale)?;
                RefreshStrategy::Targeted
            }
        };
        tx.commit()?;
        Ok(strategy)
    }

    /// Stale account Ids in Id order, stopping at the fulcrum. Accounts in
    /// the store come first, then stale entries whose account has gone.
    fn scan_stale<C>(&self, conn: &C) -> Result<Vec<Id>>
    where
        C: Connection + ?Sized,
    {
        let mut stale = Vec::new();
        let mut present = HashSet::new();
        for row in conn.query("select account_id from accounts order by account_id", &[])? {
            if stale.len() == self.fulcrum {
                return Ok(stale);
            }
            let account_id: Id = row.get_as(0)?;
            present.insert(account_id);
            if !matches!(self.map.get(&account_id), Some(Some(_))) {
                stale.push(account_id);
            }
        }
        let mut departed: Vec<Id> = self
            .map
            .iter()
            .filter(|(id, balance)| balance.is_none() && !present.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        departed.sort_unstable();
        for account_id in departed {
            if stale.len() == self.fulcrum {
                break;
            }
            stale.push(account_id);
        }
        Ok(stale)
    }

    /// Recompute every balance from scratch.
    ///
    /// Amounts are accumulated as raw integers in entry order and only
    /// turned into decimals at the end; accounts no longer in the store
    /// drop out of the map. The map is replaced only once every read has
    /// succeeded.
    fn refresh_all<C>(&mut self, conn: &C) -> Result<()>
    where
        C: Connection + ?Sized,
    {
        let mut working: HashMap<Id, (i64, u8)> = HashMap::new();
        for row in conn.query(
            "select account_id, precision from accounts join commodities using(commodity_id)",
            &[],
        )? {
            working.insert(row.get_as(0)?, (0, row.get_as(1)?));
        }
        for row in conn.query(
            "select account_id, amount from entries \
             join ordinary_journal_detail using(journal_id) order by entry_id",
            &[],
        )? {
            let account_id: Id = row.get_as(0)?;
            let amount: i64 = row.get_as(1)?;
            let Some((total, _)) = working.get_mut(&account_id) else {
                tracing::warn!(account_id, "entry refers to an account that does not exist");
                continue;
            };
            *total = total.checked_add(amount).ok_or_else(|| {
                Error::overflow(
                    OverflowErrorKind::Arithmetic,
                    format!("balance of account {} would overflow", account_id),
                )
            })?;
        }
        let pruned = self
            .map
            .keys()
            .filter(|id| !working.contains_key(*id))
            .count();
        let mut rebuilt = HashMap::with_capacity(working.len());
        for (id, (total, places)) in working {
            rebuilt.insert(id, Some(Decimal::try_new(total, places)?));
        }
        self.map = rebuilt;
        self.map_is_stale = false;
        self.stats.full_refreshes += 1;
        tracing::debug!(
            accounts = self.map.len(),
            pruned,
            strategy = "full",
            "refreshed balance cache"
        );
        Ok(())
    }

    /// Re-sum the balances of `targets` only. A target whose account has
    /// been deleted is removed from the map.
    fn refresh_targetted<C>(&mut self, conn: &C, targets: &[Id]) -> Result<()>
    where
        C: Connection + ?Sized,
    {
        let mut updated = self.map.clone();
        for &account_id in targets {
            self.stats.targeted_queries += 1;
            let sum: Option<i64> = conn
                .query_one(
                    "select sum(amount) from entries join ordinary_journal_detail \
                     using(journal_id) where account_id = ?",
                    &[Value::BigInt(account_id)],
                )?
                .map(|row| row.get_as(0))
                .transpose()?
                .flatten();
            match account::precision_of(conn, account_id)? {
                Some(places) => {
                    updated.insert(account_id, Some(Decimal::try_new(sum.unwrap_or(0), places)?));
                }
                None => {
                    updated.remove(&account_id);
                    tracing::debug!(account_id, "pruned deleted account from balance cache");
                }
            }
        }
        self.map = updated;
        self.stats.targeted_refreshes += 1;
        tracing::debug!(
            stale = targets.len(),
            strategy = "targeted",
            "refreshed balance cache"
        );
        Ok(())
    }
}
