//! Starter accounts offered when a ledger is set up.

use serde::{Deserialize, Serialize};

use crate::account::AccountType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSuggestion {
    pub name: String,
    pub account_type: AccountType,
    #[serde(default)]
    pub description: String,
}

impl AccountSuggestion {
    pub fn new(name: &str, account_type: AccountType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            account_type,
            description: description.to_string(),
        }
    }
}

/// A list of account suggestions, built once by the caller and passed to
/// [`Ledger::suggested_accounts`](crate::Ledger::suggested_accounts).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountSuggestions {
    items: Vec<AccountSuggestion>,
}

impl AccountSuggestions {
    pub fn new(items: Vec<AccountSuggestion>) -> Self {
        Self { items }
    }

    /// The usual household set. There are no equity or envelope
    /// suggestions.
    pub fn standard() -> Self {
        use AccountType::{Asset, Expense, Liability, Revenue};
        Self::new(vec![
            AccountSuggestion::new("Cash", Asset, "Notes and coins"),
            AccountSuggestion::new("Cheque account", Asset, ""),
            AccountSuggestion::new("Credit card", Liability, ""),
            AccountSuggestion::new("Salary", Revenue, ""),
            AccountSuggestion::new("Interest received", Revenue, ""),
            AccountSuggestion::new("Food", Expense, "Food and drink"),
            AccountSuggestion::new(
                "Household supplies",
                Expense,
                "Small household consumables, excluding food",
            ),
            AccountSuggestion::new("Rent", Expense, ""),
            AccountSuggestion::new("Electricity", Expense, ""),
            AccountSuggestion::new("Interest paid", Expense, ""),
            AccountSuggestion::new("Entertainment", Expense, "Books, music, films etc."),
        ])
    }

    pub fn for_type(&self, account_type: AccountType) -> impl Iterator<Item = &AccountSuggestion> {
        self.items
            .iter()
            .filter(move |s| s.account_type == account_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountSuggestion> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
