//! Ledger configuration.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tally_core::{ConfigError, Error, Result};
use tally_sqlite::SqliteConfig;
use tally_sqlite::connection::DEFAULT_STATEMENT_CACHE_CAPACITY;

/// Days since 1970-01-01.
pub type DayNumber = i64;

/// Stale accounts a refresh may find before it rebuilds every balance.
pub const DEFAULT_BALANCE_FULCRUM: usize = 5;

/// Which identity maps keep orphaned objects for reuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingLevel {
    /// Evict every object as soon as its last handle goes.
    #[default]
    Minimal,
    /// Keep commodities and accounts.
    Accounts,
    /// Keep every entity type.
    Full,
}

/// Settings for opening a [`Ledger`](crate::Ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Database file, or ":memory:".
    pub path: String,
    pub caching: CachingLevel,
    pub balance_fulcrum: usize,
    /// Abbreviation of the commodity created with a new ledger.
    pub default_commodity: String,
    pub default_commodity_precision: u8,
    /// Entity creation date for a new ledger. Defaults to today.
    pub creation_date: Option<DayNumber>,
    pub max_transaction_nesting: usize,
    pub statement_cache_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            caching: CachingLevel::Minimal,
            balance_fulcrum: DEFAULT_BALANCE_FULCRUM,
            default_commodity: "AUD".to_string(),
            default_commodity_precision: 2,
            creation_date: None,
            max_transaction_nesting: i32::MAX as usize,
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
        }
    }
}

impl LedgerConfig {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn caching(mut self, level: CachingLevel) -> Self {
        self.caching = level;
        self
    }

    pub fn balance_fulcrum(mut self, fulcrum: usize) -> Self {
        self.balance_fulcrum = fulcrum;
        self
    }

    pub fn default_commodity(mut self, abbreviation: impl Into<String>, precision: u8) -> Self {
        self.default_commodity = abbreviation.into();
        self.default_commodity_precision = precision;
        self
    }

    pub fn creation_date(mut self, date: DayNumber) -> Self {
        self.creation_date = Some(date);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text).map_err(|e| match e {
            Error::Serde(message) => Error::Config(ConfigError {
                message: format!("{}: {}", path.as_ref().display(), message),
                source: None,
            }),
            other => other,
        })
    }

    /// Reject settings the ledger cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.balance_fulcrum == 0 {
            return Err(config_error("balance_fulcrum must be at least 1"));
        }
        if self.default_commodity.trim().is_empty() {
            return Err(config_error("default_commodity must not be empty"));
        }
        if self.default_commodity_precision > crate::Decimal::MAX_PLACES {
            return Err(config_error(format!(
                "default_commodity_precision must be at most {}",
                crate::Decimal::MAX_PLACES
            )));
        }
        if self.max_transaction_nesting == 0 {
            return Err(config_error("max_transaction_nesting must be at least 1"));
        }
        Ok(())
    }

    /// Store settings for this ledger.
    pub fn sqlite_config(&self) -> SqliteConfig {
        SqliteConfig::file(self.path.clone())
            .max_transaction_nesting(self.max_transaction_nesting)
            .statement_cache_capacity(self.statement_cache_capacity)
            .foreign_keys(true)
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

/// Today as a day number, in UTC.
pub fn today() -> DayNumber {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    i64::try_from(secs / 86_400).unwrap_or(i64::MAX)
}
