// =============================================================================
// Account Book — balances, equity, and margin per trading account
// =============================================================================
//
// Accounts are created by an external service; the engine only mutates them
// through fills, mark-to-market updates, and journal replay. Equity is always
// balance + the sum of unrealized P&L over the account's open positions.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::AccountState;

/// One trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
    pub leverage: Decimal,
    /// Extra headroom granted on top of balance for margin checks.
    #[serde(default)]
    pub credit: Decimal,
    #[serde(default)]
    pub state: AccountState,
    /// Realized P&L accumulated since the last daily rollover.
    #[serde(default)]
    pub day_realized_pnl: Decimal,
}

impl Account {
    pub fn new(id: &str, balance: Decimal, leverage: Decimal) -> Self {
        Self {
            id: id.to_string(),
            balance,
            equity: balance,
            margin_used: Decimal::ZERO,
            margin_available: balance,
            leverage,
            credit: Decimal::ZERO,
            state: AccountState::Active,
            day_realized_pnl: Decimal::ZERO,
        }
    }
}

// =============================================================================
// Account Book
// =============================================================================

/// Thread-safe store of all accounts known to the engine.
pub struct AccountBook {
    accounts: RwLock<HashMap<String, Account>>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace an account record.
    pub fn upsert(&self, account: Account) {
        info!(id = %account.id, balance = %account.balance, "account registered");
        self.accounts.write().insert(account.id.clone(), account);
    }

    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts.read().get(id).cloned()
    }

    pub fn set_state(&self, id: &str, state: AccountState) -> bool {
        let mut accounts = self.accounts.write();
        match accounts.get_mut(id) {
            Some(a) => {
                info!(id, state = %state, "account state changed");
                a.state = state;
                true
            }
            None => false,
        }
    }

    /// Apply realized P&L (net of commission) from a closed quantity.
    pub fn apply_realized(&self, id: &str, pnl: Decimal, commission: Decimal) {
        let mut accounts = self.accounts.write();
        if let Some(a) = accounts.get_mut(id) {
            let net = pnl - commission;
            a.balance += net;
            a.day_realized_pnl += net;
            a.equity = a.balance; // marks are re-applied on the next tick
            debug!(id, pnl = %pnl, commission = %commission, balance = %a.balance, "realized pnl applied");
        }
    }

    /// Refresh equity and margin figures from the open-position aggregate.
    ///
    /// `unrealized` is the summed unrealized P&L over the account's open
    /// positions; `margin_used` is the summed position notional divided by
    /// account leverage.
    pub fn update_marks(&self, id: &str, unrealized: Decimal, margin_used: Decimal) {
        let mut accounts = self.accounts.write();
        if let Some(a) = accounts.get_mut(id) {
            a.equity = a.balance + unrealized;
            a.margin_used = margin_used;
            a.margin_available = a.equity + a.credit - a.margin_used;
        }
    }

    /// Reset the daily realized P&L counter (session rollover).
    pub fn roll_day(&self) {
        let mut accounts = self.accounts.write();
        for a in accounts.values_mut() {
            a.day_realized_pnl = Decimal::ZERO;
        }
        info!(count = accounts.len(), "daily account counters rolled");
    }

    /// Snapshot of every account.
    pub fn all(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }
}

impl Default for AccountBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AccountBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBook")
            .field("accounts", &self.accounts.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_with_account() -> AccountBook {
        let book = AccountBook::new();
        book.upsert(Account::new("A", dec!(10000), dec!(100)));
        book
    }

    #[test]
    fn new_account_equity_equals_balance() {
        let a = Account::new("A", dec!(5000), dec!(50));
        assert_eq!(a.equity, dec!(5000));
        assert_eq!(a.margin_available, dec!(5000));
        assert_eq!(a.state, AccountState::Active);
    }

    #[test]
    fn realized_pnl_moves_balance_and_day_counter() {
        let book = book_with_account();
        book.apply_realized("A", dec!(-121.00), dec!(2.50));
        let a = book.get("A").unwrap();
        assert_eq!(a.balance, dec!(9876.50));
        assert_eq!(a.day_realized_pnl, dec!(-123.50));
    }

    #[test]
    fn marks_update_equity_and_margin() {
        let book = book_with_account();
        book.update_marks("A", dec!(250), dec!(1100.20));
        let a = book.get("A").unwrap();
        assert_eq!(a.equity, dec!(10250));
        assert_eq!(a.margin_used, dec!(1100.20));
        assert_eq!(a.margin_available, dec!(10250) - dec!(1100.20));
    }

    #[test]
    fn day_roll_resets_counter_only() {
        let book = book_with_account();
        book.apply_realized("A", dec!(100), Decimal::ZERO);
        book.roll_day();
        let a = book.get("A").unwrap();
        assert_eq!(a.day_realized_pnl, Decimal::ZERO);
        assert_eq!(a.balance, dec!(10100));
    }

    #[test]
    fn state_transitions() {
        let book = book_with_account();
        assert!(book.set_state("A", AccountState::Locked));
        assert_eq!(book.get("A").unwrap().state, AccountState::Locked);
        assert!(!book.set_state("missing", AccountState::Closed));
    }
}
