// =============================================================================
// Risk Engine — pre-trade gate protecting accounts and the book
// =============================================================================
//
// Checks run in a fixed order and the first failure short-circuits with its
// typed reason:
//
//   1. account inactive          5. leverage exceeded
//   2. symbol untradable         6. position limit exceeded
//   3. breaker tripped           7. daily loss limit exceeded
//   4. margin insufficient
//
// Margin is notional / leverage; the daily loss check sums realized and
// unrealized P&L since the session roll.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::accounts::AccountBook;
use crate::breakers::BreakerPanel;
use crate::instruments::Instrument;
use crate::oms::PositionBook;
use crate::types::{AccountState, RejectReason, Rejection, Side};

/// An order intent as the gate sees it.
#[derive(Debug, Clone)]
pub struct OrderIntent<'a> {
    pub account_id: &'a str,
    pub symbol: &'a str,
    pub side: Side,
    pub qty: Decimal,
    /// Reference price for notional: the limit price or the current best
    /// opposite-side quote.
    pub ref_price: Decimal,
}

/// Pre-trade risk gate.
pub struct RiskEngine {
    accounts: Arc<AccountBook>,
    positions: Arc<PositionBook>,
    breakers: Arc<BreakerPanel>,
    max_open_positions_per_account: usize,
    daily_loss_limit: Decimal,
}

impl RiskEngine {
    pub fn new(
        accounts: Arc<AccountBook>,
        positions: Arc<PositionBook>,
        breakers: Arc<BreakerPanel>,
        max_open_positions_per_account: usize,
        daily_loss_limit: Decimal,
    ) -> Self {
        Self {
            accounts,
            positions,
            breakers,
            max_open_positions_per_account,
            daily_loss_limit,
        }
    }

    /// Run every check in order; the first failure wins.
    pub fn pre_trade(
        &self,
        intent: &OrderIntent<'_>,
        instrument: &Instrument,
        now_ms: u64,
    ) -> Result<(), Rejection> {
        // --- 1. Account state ------------------------------------------------
        let account = self
            .accounts
            .get(intent.account_id)
            .ok_or_else(|| {
                Rejection::with_detail(
                    RejectReason::AccountInactive,
                    serde_json::json!({ "accountId": intent.account_id, "error": "unknown account" }),
                )
            })?;
        if account.state != AccountState::Active {
            return Err(Rejection::with_detail(
                RejectReason::AccountInactive,
                serde_json::json!({ "state": account.state.to_string() }),
            ));
        }

        // --- 2. Instrument tradable ------------------------------------------
        if !instrument.tradable_at(now_ms) {
            return Err(Rejection::with_detail(
                RejectReason::SymbolUntradable,
                serde_json::json!({ "symbol": intent.symbol }),
            ));
        }

        // --- 3. Circuit breakers ---------------------------------------------
        if let Some(name) = self.breakers.blocks(intent.symbol, intent.account_id) {
            return Err(Rejection::with_detail(
                RejectReason::BreakerTripped,
                serde_json::json!({ "breaker": name }),
            ));
        }

        // --- 4. Margin --------------------------------------------------------
        let notional = intent.qty * instrument.contract_size * intent.ref_price;
        let leverage_cap = account.leverage.min(instrument.max_leverage);
        let required_margin = if account.leverage.is_zero() {
            notional
        } else {
            notional / account.leverage
        };
        let funds = account.balance + account.credit;
        if account.margin_used + required_margin > funds {
            return Err(Rejection::with_detail(
                RejectReason::MarginInsufficient,
                serde_json::json!({
                    "required": (account.margin_used + required_margin).to_string(),
                    "available": funds.to_string(),
                }),
            ));
        }

        // --- 5. Leverage ------------------------------------------------------
        let equity = account.equity.max(Decimal::ONE);
        let total_notional = self.positions.notional_for_account(intent.account_id) + notional;
        let effective_leverage = total_notional / equity;
        if effective_leverage > leverage_cap {
            return Err(Rejection::with_detail(
                RejectReason::LeverageExceeded,
                serde_json::json!({
                    "effective": effective_leverage.round_dp(2).to_string(),
                    "cap": leverage_cap.to_string(),
                }),
            ));
        }

        // --- 6. Open position cap --------------------------------------------
        let open = self.positions.open_count(intent.account_id);
        if open + 1 > self.max_open_positions_per_account {
            return Err(Rejection::with_detail(
                RejectReason::PositionLimitExceeded,
                serde_json::json!({
                    "open": open,
                    "cap": self.max_open_positions_per_account,
                }),
            ));
        }

        // --- 7. Daily loss ----------------------------------------------------
        let day_pnl =
            account.day_realized_pnl + self.positions.unrealized_for_account(intent.account_id);
        if day_pnl <= -self.daily_loss_limit {
            return Err(Rejection::with_detail(
                RejectReason::DailyLossLimitExceeded,
                serde_json::json!({
                    "dayPnl": day_pnl.to_string(),
                    "limit": self.daily_loss_limit.to_string(),
                }),
            ));
        }

        debug!(
            account_id = intent.account_id,
            symbol = intent.symbol,
            qty = %intent.qty,
            required_margin = %required_margin,
            "pre-trade checks passed"
        );
        Ok(())
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("max_open_positions", &self.max_open_positions_per_account)
            .field("daily_loss_limit", &self.daily_loss_limit)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
