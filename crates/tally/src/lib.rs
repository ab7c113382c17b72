//! Double-entry bookkeeping on top of `tally-session`.
//!
//! A [`Ledger`] owns a SQLite database of commodities, accounts, journals and
//! entries. Each of those is a [`PersistentObject`](tally_session::PersistentObject)
//! reached through a [`Handle`](tally_session::Handle), so two handles for
//! the same row always share one in-memory object. Account balances come
//! from a [`BalanceCache`] that every entity marks stale as it changes.
//!
//! # Example
//!
//! ```rust,ignore
//! use tally::{Account, AccountType, Decimal, Entry, Journal, JournalKind, Ledger};
//! use tally_session::{Handle, PersistentObject};
//!
//! let ledger = Ledger::open_memory()?;
//! let cash = Handle::<Account>::new(&ledger)?;
//! cash.set_name("Cash")?;
//! cash.set_account_type(AccountType::Asset)?;
//! cash.set_commodity(&ledger.default_commodity()?)?;
//! cash.save()?;
//!
//! let journal = Handle::<Journal>::new(&ledger)?;
//! journal.set_kind(JournalKind::Ordinary { date: ledger.creation_date() })?;
//! journal.save()?;
//!
//! let entry = Handle::<Entry>::new(&ledger)?;
//! entry.set_journal(&journal)?;
//! entry.set_account(&cash)?;
//! entry.set_amount("150.25".parse()?)?;
//! entry.save()?;
//!
//! assert_eq!(cash.technical_balance()?, "150.25".parse::<Decimal>()?);
//! ```

pub mod account;
pub mod balance_cache;
pub mod commodity;
pub mod config;
pub mod decimal;
pub mod entry;
mod field;
pub mod journal;
pub mod ledger;
mod schema;
pub mod suggestions;

pub use account::{Account, AccountType};
pub use balance_cache::{BalanceCache, BalanceCacheStats, RefreshStrategy};
pub use commodity::Commodity;
pub use config::{CachingLevel, DayNumber, LedgerConfig};
pub use decimal::Decimal;
pub use entry::Entry;
pub use journal::{Journal, JournalKind};
pub use ledger::Ledger;
pub use suggestions::{AccountSuggestion, AccountSuggestions};
