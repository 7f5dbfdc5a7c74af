// =============================================================================
// Position Book — FIFO lots, realized/unrealized P&L, protective levels
// =============================================================================
//
// Two aggregation modes:
//
//   hedging  — long and short positions coexist per (account, symbol); a
//              fill opens or grows its own side unless it carries close
//              intent, in which case it reduces the opposite side FIFO.
//   netting  — exactly one position per (account, symbol); opposite fills
//              reduce it FIFO and flip its side past the zero crossing,
//              realizing P&L on the crossed quantity.
//
// Realized P&L per unit closed: long (close - entry) x contract size,
// short (entry - close) x contract size. Unrealized marks use the opposite
// book side (bid for longs, ask for shorts); a stale market holds the last
// mark and flags it.
// =============================================================================

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::types::{MarginMode, PositionSide, RejectReason, Rejection, Side};

/// One entry parcel inside a position, consumed FIFO on reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub qty: Decimal,
    pub price: Decimal,
    pub ts: u64,
}

/// An open or closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub contract_size: Decimal,
    pub lots: Vec<Lot>,
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    /// True while the mark is held from a stale market.
    #[serde(default)]
    pub mark_stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_distance: Option<Decimal>,
    pub opened_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl Position {
    pub fn qty(&self) -> Decimal {
        self.lots.iter().map(|l| l.qty).sum()
    }

    /// Quantity-weighted average entry over the remaining lots.
    pub fn avg_entry(&self) -> Decimal {
        let qty = self.qty();
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        let weighted: Decimal = self.lots.iter().map(|l| l.qty * l.price).sum();
        weighted / qty
    }

    /// Position notional at its average entry.
    pub fn notional(&self) -> Decimal {
        self.qty() * self.contract_size * self.avg_entry()
    }

    pub fn is_open(&self) -> bool {
        !self.qty().is_zero()
    }
}

/// Why a protective exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit => write!(f, "TP"),
        }
    }
}

/// A protective exit that should become a synthetic market close.
#[derive(Debug, Clone, Serialize)]
pub struct ExitTrigger {
    pub position_id: String,
    pub account_id: String,
    pub symbol: String,
    pub close_side: Side,
    pub qty: Decimal,
    pub reason: ExitReason,
    /// The book price that tripped the level.
    pub ref_price: Decimal,
}

/// Whether a fill builds its own side or unwinds the opposite one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillIntent {
    Open,
    Close { position_id: Option<String> },
}

/// Net effect of applying one fill, consumed by exposure and the journal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FillApplication {
    pub realized_pnl: Decimal,
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    /// Signed change of net exposure, in contract units.
    pub net_delta: Decimal,
    /// Change of gross exposure (sum of absolute position sizes), in
    /// contract units.
    pub gross_delta: Decimal,
}

// =============================================================================
// Position Book
// =============================================================================

/// Thread-safe owner of the open and closed position lists.
pub struct PositionBook {
    mode: MarginMode,
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    clock: SharedClock,
}

impl PositionBook {
    pub fn new(mode: MarginMode, clock: SharedClock) -> Self {
        Self {
            mode,
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            clock,
        }
    }

    pub fn mode(&self) -> MarginMode {
        self.mode
    }

    // -------------------------------------------------------------------------
    // Fill application
    // -------------------------------------------------------------------------

    /// Apply one fill to the book and report its aggregate effect.
    pub fn apply_fill(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        contract_size: Decimal,
        intent: FillIntent,
    ) -> FillApplication {
        match self.mode {
            MarginMode::Hedging => {
                self.apply_hedging(account_id, symbol, side, qty, price, contract_size, intent)
            }
            MarginMode::Netting => {
                self.apply_netting(account_id, symbol, side, qty, price, contract_size)
            }
        }
    }

    fn apply_hedging(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        contract_size: Decimal,
        intent: FillIntent,
    ) -> FillApplication {
        let mut app = FillApplication::default();

        let close_target = match &intent {
            FillIntent::Close { position_id } => {
                let target_side = side.flip().position_side();
                let open = self.open.read();
                let found = open
                    .iter()
                    .find(|p| match position_id {
                        Some(id) => &p.id == id,
                        None => {
                            p.account_id == account_id
                                && p.symbol == symbol
                                && p.side == target_side
                        }
                    })
                    .map(|p| p.id.clone());
                if found.is_none() {
                    warn!(account_id, symbol, "close intent without matching position, opening instead");
                }
                found
            }
            FillIntent::Open => None,
        };

        match close_target {
            Some(position_id) => {
                let leftover = self.reduce_position(&position_id, qty, price, &mut app);
                if leftover > Decimal::ZERO {
                    self.open_or_increase(
                        account_id,
                        symbol,
                        side.position_side(),
                        leftover,
                        price,
                        contract_size,
                        &mut app,
                    );
                }
            }
            None => {
                self.open_or_increase(
                    account_id,
                    symbol,
                    side.position_side(),
                    qty,
                    price,
                    contract_size,
                    &mut app,
                );
            }
        }

        app
    }

    fn apply_netting(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
        contract_size: Decimal,
    ) -> FillApplication {
        let mut app = FillApplication::default();
        let fill_side = side.position_side();

        let existing = {
            let open = self.open.read();
            open.iter()
                .find(|p| p.account_id == account_id && p.symbol == symbol)
                .map(|p| (p.id.clone(), p.side))
        };

        match existing {
            None => {
                self.open_or_increase(
                    account_id, symbol, fill_side, qty, price, contract_size, &mut app,
                );
            }
            Some((id, pos_side)) if pos_side == fill_side => {
                let mut open = self.open.write();
                if let Some(pos) = open.iter_mut().find(|p| p.id == id) {
                    pos.lots.push(Lot {
                        qty,
                        price,
                        ts: self.clock.now_ms(),
                    });
                    app.net_delta += fill_side.sign() * qty * contract_size;
                    app.gross_delta += qty * contract_size;
                }
            }
            Some((id, _)) => {
                // Opposite direction: unwind FIFO, flip past zero.
                let leftover = self.reduce_position(&id, qty, price, &mut app);
                if leftover > Decimal::ZERO {
                    self.open_or_increase(
                        account_id,
                        symbol,
                        fill_side,
                        leftover,
                        price,
                        contract_size,
                        &mut app,
                    );
                }
            }
        }

        app
    }

    fn open_or_increase(
        &self,
        account_id: &str,
        symbol: &str,
        side: PositionSide,
        qty: Decimal,
        price: Decimal,
        contract_size: Decimal,
        app: &mut FillApplication,
    ) {
        let now = self.clock.now_ms();
        let mut open = self.open.write();

        let lot = Lot {
            qty,
            price,
            ts: now,
        };

        match open
            .iter_mut()
            .find(|p| p.account_id == account_id && p.symbol == symbol && p.side == side)
        {
            Some(pos) => {
                pos.lots.push(lot);
                debug!(position_id = %pos.id, qty = %qty, price = %price, "position increased");
            }
            None => {
                let pos = Position {
                    id: Uuid::new_v4().to_string(),
                    account_id: account_id.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    contract_size,
                    lots: vec![lot],
                    realized_pnl: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                    mark_stale: false,
                    sl: None,
                    tp: None,
                    trailing_distance: None,
                    opened_at: now,
                    closed_at: None,
                    close_reason: None,
                };
                info!(
                    position_id = %pos.id,
                    account_id,
                    symbol,
                    side = %side,
                    qty = %qty,
                    entry = %price,
                    "position opened"
                );
                app.opened.push(pos.id.clone());
                open.push(pos);
            }
        }

        app.net_delta += side.sign() * qty * contract_size;
        app.gross_delta += qty * contract_size;
    }

    /// Consume lots FIFO against a closing price. Returns the unmatched
    /// remainder of `qty` (non-zero only when the fill exceeds the
    /// position).
    fn reduce_position(
        &self,
        position_id: &str,
        qty: Decimal,
        price: Decimal,
        app: &mut FillApplication,
    ) -> Decimal {
        let mut open = self.open.write();
        let Some(idx) = open.iter().position(|p| p.id == position_id) else {
            return qty;
        };

        let pos = &mut open[idx];
        let mut remaining = qty;
        let mut closed_qty = Decimal::ZERO;
        let mut realized = Decimal::ZERO;

        while remaining > Decimal::ZERO && !pos.lots.is_empty() {
            let lot_qty = pos.lots[0].qty;
            let lot_price = pos.lots[0].price;
            let take = lot_qty.min(remaining);

            let per_unit = match pos.side {
                PositionSide::Long => price - lot_price,
                PositionSide::Short => lot_price - price,
            };
            realized += per_unit * take * pos.contract_size;

            if take == lot_qty {
                pos.lots.remove(0);
            } else {
                pos.lots[0].qty -= take;
            }
            remaining -= take;
            closed_qty += take;
        }

        pos.realized_pnl += realized;
        app.realized_pnl += realized;
        app.net_delta -= pos.side.sign() * closed_qty * pos.contract_size;
        app.gross_delta -= closed_qty * pos.contract_size;

        debug!(
            position_id,
            closed_qty = %closed_qty,
            realized = %realized,
            remaining_qty = %pos.qty(),
            "position reduced"
        );

        if !pos.is_open() {
            let mut pos = open.remove(idx);
            pos.closed_at = Some(self.clock.now_ms());
            pos.unrealized_pnl = Decimal::ZERO;
            if pos.close_reason.is_none() {
                pos.close_reason = Some("close".to_string());
            }
            info!(
                position_id = %pos.id,
                realized = %pos.realized_pnl,
                "position closed"
            );
            app.closed.push(pos.id.clone());
            self.closed.write().push(pos);
        }

        remaining
    }

    // -------------------------------------------------------------------------
    // Marks and protective exits
    // -------------------------------------------------------------------------

    /// Refresh unrealized P&L for every open position on `symbol` against a
    /// fresh best quote.
    pub fn mark(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let mut open = self.open.write();
        for pos in open.iter_mut().filter(|p| p.symbol == symbol) {
            let mark = match pos.side {
                PositionSide::Long => bid,
                PositionSide::Short => ask,
            };
            let per_unit = match pos.side {
                PositionSide::Long => mark - pos.avg_entry(),
                PositionSide::Short => pos.avg_entry() - mark,
            };
            pos.unrealized_pnl = per_unit * pos.qty() * pos.contract_size;
            pos.mark_stale = false;
        }
    }

    /// Hold the last marks for `symbol` and flag them stale.
    pub fn flag_stale(&self, symbol: &str) {
        let mut open = self.open.write();
        for pos in open.iter_mut().filter(|p| p.symbol == symbol) {
            pos.mark_stale = true;
        }
    }

    /// Ratchet trailing stops and collect SL/TP triggers for `symbol`.
    ///
    /// Longs trigger on the bid, shorts on the ask. Trailing stops only ever
    /// tighten: a long's stop rises with the bid, a short's falls with the
    /// ask, never the other way.
    pub fn check_exits(&self, symbol: &str, bid: Decimal, ask: Decimal) -> Vec<ExitTrigger> {
        let mut triggers = Vec::new();
        let mut open = self.open.write();

        for pos in open.iter_mut().filter(|p| p.symbol == symbol) {
            // Trailing ratchet before level checks.
            if let Some(distance) = pos.trailing_distance {
                match pos.side {
                    PositionSide::Long => {
                        let candidate = bid - distance;
                        if pos.sl.map_or(true, |sl| candidate > sl) {
                            debug!(position_id = %pos.id, sl = %candidate, "trailing stop raised");
                            pos.sl = Some(candidate);
                        }
                    }
                    PositionSide::Short => {
                        let candidate = ask + distance;
                        if pos.sl.map_or(true, |sl| candidate < sl) {
                            debug!(position_id = %pos.id, sl = %candidate, "trailing stop lowered");
                            pos.sl = Some(candidate);
                        }
                    }
                }
            }

            let (trigger_price, close_side) = match pos.side {
                PositionSide::Long => (bid, Side::Sell),
                PositionSide::Short => (ask, Side::Buy),
            };

            let sl_hit = pos.sl.map_or(false, |sl| match pos.side {
                PositionSide::Long => trigger_price <= sl,
                PositionSide::Short => trigger_price >= sl,
            });
            let tp_hit = pos.tp.map_or(false, |tp| match pos.side {
                PositionSide::Long => trigger_price >= tp,
                PositionSide::Short => trigger_price <= tp,
            });

            if sl_hit || tp_hit {
                triggers.push(ExitTrigger {
                    position_id: pos.id.clone(),
                    account_id: pos.account_id.clone(),
                    symbol: pos.symbol.clone(),
                    close_side,
                    qty: pos.qty(),
                    reason: if sl_hit {
                        ExitReason::StopLoss
                    } else {
                        ExitReason::TakeProfit
                    },
                    ref_price: trigger_price,
                });
            }
        }

        triggers
    }

    /// Update protective levels on an open position.
    pub fn set_protections(
        &self,
        position_id: &str,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
        trailing_distance: Option<Decimal>,
    ) -> Result<(), Rejection> {
        let mut open = self.open.write();
        let pos = open
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| Rejection::new(RejectReason::UnknownPosition))?;
        if let Some(sl) = sl {
            pos.sl = Some(sl);
        }
        if let Some(tp) = tp {
            pos.tp = Some(tp);
        }
        if let Some(d) = trailing_distance {
            pos.trailing_distance = Some(d);
        }
        Ok(())
    }

    /// Record why a position is about to close (exit reason audit).
    pub fn set_close_reason(&self, position_id: &str, reason: &str) {
        let mut open = self.open.write();
        if let Some(pos) = open.iter_mut().find(|p| p.id == position_id) {
            pos.close_reason = Some(reason.to_string());
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, position_id: &str) -> Option<Position> {
        self.open
            .read()
            .iter()
            .find(|p| p.id == position_id)
            .cloned()
            .or_else(|| {
                self.closed
                    .read()
                    .iter()
                    .find(|p| p.id == position_id)
                    .cloned()
            })
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    pub fn positions_for_account(&self, account_id: &str) -> Vec<Position> {
        self.open
            .read()
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn closed_positions(&self, max: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(max).cloned().collect()
    }

    pub fn open_count(&self, account_id: &str) -> usize {
        self.open
            .read()
            .iter()
            .filter(|p| p.account_id == account_id)
            .count()
    }

    /// Summed unrealized P&L over an account's open positions.
    pub fn unrealized_for_account(&self, account_id: &str) -> Decimal {
        self.open
            .read()
            .iter()
            .filter(|p| p.account_id == account_id)
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    /// Replace the open book wholesale (snapshot restore at startup).
    pub fn restore(&self, positions: Vec<Position>) {
        let mut open = self.open.write();
        info!(count = positions.len(), "position book restored");
        *open = positions.into_iter().filter(|p| p.is_open()).collect();
    }

    /// Summed notional over an account's open positions (margin basis).
    pub fn notional_for_account(&self, account_id: &str) -> Decimal {
        self.open
            .read()
            .iter()
            .filter(|p| p.account_id == account_id)
            .map(|p| p.notional())
            .sum()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("mode", &self.mode)
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    const CS: Decimal = dec!(100000);

    fn book(mode: MarginMode) -> PositionBook {
        PositionBook::new(mode, Arc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn open_long_and_weighted_average_entry() {
        let book = book(MarginMode::Hedging);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10000), CS, FillIntent::Open);
        let app =
            book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);

        // Second fill increased the existing long rather than opening.
        assert!(app.opened.is_empty());
        let positions = book.positions_for_account("A");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty(), dec!(2));
        assert_eq!(positions[0].avg_entry(), dec!(1.10010));
    }

    #[test]
    fn hedging_opposite_open_keeps_two_positions() {
        let book = book(MarginMode::Hedging);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        book.apply_fill("A", "EURUSD", Side::Sell, dec!(1), dec!(1.10000), CS, FillIntent::Open);

        let positions = book.positions_for_account("A");
        assert_eq!(positions.len(), 2);
        let sides: Vec<PositionSide> = positions.iter().map(|p| p.side).collect();
        assert!(sides.contains(&PositionSide::Long));
        assert!(sides.contains(&PositionSide::Short));
    }

    #[test]
    fn hedging_close_realizes_fifo() {
        let book = book(MarginMode::Hedging);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10000), CS, FillIntent::Open);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);

        // Close half: only the first (oldest) lot realizes.
        let app = book.apply_fill(
            "A",
            "EURUSD",
            Side::Sell,
            dec!(1),
            dec!(1.10050),
            CS,
            FillIntent::Close { position_id: None },
        );
        // (1.10050 - 1.10000) * 100000 = 50
        assert_eq!(app.realized_pnl, dec!(50.00000));
        let pos = &book.positions_for_account("A")[0];
        assert_eq!(pos.qty(), dec!(1));
        assert_eq!(pos.avg_entry(), dec!(1.10020));
    }

    #[test]
    fn full_close_moves_to_closed_list() {
        let book = book(MarginMode::Hedging);
        let app =
            book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        let position_id = app.opened[0].clone();

        let app = book.apply_fill(
            "A",
            "EURUSD",
            Side::Sell,
            dec!(1),
            dec!(1.09899),
            CS,
            FillIntent::Close {
                position_id: Some(position_id.clone()),
            },
        );
        // (1.09899 - 1.10020) * 100000 = -121
        assert_eq!(app.realized_pnl, dec!(-121.00000));
        assert_eq!(app.closed, vec![position_id.clone()]);
        assert!(book.positions_for_account("A").is_empty());

        let closed = book.get(&position_id).unwrap();
        assert!(!closed.is_open());
        assert!(closed.closed_at.is_some());
    }

    #[test]
    fn netting_round_trip_realizes_spread() {
        let book = book(MarginMode::Netting);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        let app =
            book.apply_fill("A", "EURUSD", Side::Sell, dec!(1), dec!(1.10120), CS, FillIntent::Open);

        // (sell - buy) * contract * qty
        assert_eq!(app.realized_pnl, dec!(100.00000));
        assert!(book.positions_for_account("A").is_empty());
        assert_eq!(app.net_delta, dec!(-100000));
    }

    #[test]
    fn netting_zero_cross_flips_side() {
        let book = book(MarginMode::Netting);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10000), CS, FillIntent::Open);
        let app =
            book.apply_fill("A", "EURUSD", Side::Sell, dec!(1.5), dec!(1.10100), CS, FillIntent::Open);

        // The long unit realizes; the excess 0.5 opens a short at the fill.
        assert_eq!(app.realized_pnl, dec!(100.00000));
        let positions = book.positions_for_account("A");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].qty(), dec!(0.5));
        assert_eq!(positions[0].avg_entry(), dec!(1.10100));
    }

    #[test]
    fn hedging_and_netting_realized_agree() {
        // Opposite equal fills: hedging keeps two positions whose marks sum
        // to the netting-mode realized result.
        let buy_price = dec!(1.10020);
        let sell_price = dec!(1.10120);

        let netting = book(MarginMode::Netting);
        netting.apply_fill("A", "EURUSD", Side::Buy, dec!(1), buy_price, CS, FillIntent::Open);
        let net_app =
            netting.apply_fill("A", "EURUSD", Side::Sell, dec!(1), sell_price, CS, FillIntent::Open);

        let hedging = book(MarginMode::Hedging);
        hedging.apply_fill("A", "EURUSD", Side::Buy, dec!(1), buy_price, CS, FillIntent::Open);
        hedging.apply_fill("A", "EURUSD", Side::Sell, dec!(1), sell_price, CS, FillIntent::Open);

        // Mark both hedged positions at a common quote.
        hedging.mark("EURUSD", dec!(1.10120), dec!(1.10120));
        let total_unrealized: Decimal = hedging
            .positions_for_account("A")
            .iter()
            .map(|p| p.unrealized_pnl)
            .sum();

        assert_eq!(net_app.realized_pnl, total_unrealized);
    }

    #[test]
    fn marks_use_opposite_side_of_book() {
        let book = book(MarginMode::Hedging);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        book.apply_fill("A", "EURUSD", Side::Sell, dec!(1), dec!(1.10000), CS, FillIntent::Open);

        book.mark("EURUSD", dec!(1.10050), dec!(1.10070));
        for pos in book.positions_for_account("A") {
            match pos.side {
                // Long marks at bid: (1.10050 - 1.10020) * 100000
                PositionSide::Long => assert_eq!(pos.unrealized_pnl, dec!(30.00000)),
                // Short marks at ask: (1.10000 - 1.10070) * 100000
                PositionSide::Short => assert_eq!(pos.unrealized_pnl, dec!(-70.00000)),
            }
            assert!(!pos.mark_stale);
        }

        book.flag_stale("EURUSD");
        for pos in book.positions_for_account("A") {
            assert!(pos.mark_stale);
            // Held, not zeroed.
            assert!(!pos.unrealized_pnl.is_zero());
        }
    }

    #[test]
    fn stop_loss_triggers_on_bid_for_long() {
        let book = book(MarginMode::Hedging);
        let app =
            book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        book.set_protections(&app.opened[0], Some(dec!(1.09900)), None, None)
            .unwrap();

        // Bid above the stop: nothing fires.
        assert!(book.check_exits("EURUSD", dec!(1.09901), dec!(1.09921)).is_empty());

        let triggers = book.check_exits("EURUSD", dec!(1.09899), dec!(1.09919));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].reason, ExitReason::StopLoss);
        assert_eq!(triggers[0].close_side, Side::Sell);
        assert_eq!(triggers[0].qty, dec!(1));
        assert_eq!(triggers[0].ref_price, dec!(1.09899));
    }

    #[test]
    fn take_profit_triggers_on_ask_for_short() {
        let book = book(MarginMode::Hedging);
        let app =
            book.apply_fill("A", "EURUSD", Side::Sell, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        book.set_protections(&app.opened[0], None, Some(dec!(1.09900)), None)
            .unwrap();

        let triggers = book.check_exits("EURUSD", dec!(1.09880), dec!(1.09899));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].reason, ExitReason::TakeProfit);
        assert_eq!(triggers[0].close_side, Side::Buy);
    }

    #[test]
    fn trailing_stop_only_tightens() {
        let book = book(MarginMode::Hedging);
        let app =
            book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10000), CS, FillIntent::Open);
        let id = app.opened[0].clone();
        book.set_protections(&id, None, None, Some(dec!(0.00100))).unwrap();

        // First tick arms the trail below the bid.
        book.check_exits("EURUSD", dec!(1.10050), dec!(1.10070));
        let sl1 = book.get(&id).unwrap().sl.unwrap();
        assert_eq!(sl1, dec!(1.09950));

        // Higher bid ratchets the stop up.
        book.check_exits("EURUSD", dec!(1.10150), dec!(1.10170));
        let sl2 = book.get(&id).unwrap().sl.unwrap();
        assert_eq!(sl2, dec!(1.10050));

        // Lower bid must not loosen it.
        let triggers = book.check_exits("EURUSD", dec!(1.10060), dec!(1.10080));
        assert!(triggers.is_empty());
        assert_eq!(book.get(&id).unwrap().sl.unwrap(), dec!(1.10050));

        // Falling through the trail fires a stop.
        let triggers = book.check_exits("EURUSD", dec!(1.10049), dec!(1.10069));
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].reason, ExitReason::StopLoss);
    }

    #[test]
    fn exposure_deltas_track_contract_units() {
        let book = book(MarginMode::Hedging);
        let app =
            book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        assert_eq!(app.net_delta, dec!(100000));
        assert_eq!(app.gross_delta, dec!(100000));

        let app = book.apply_fill(
            "A",
            "EURUSD",
            Side::Sell,
            dec!(1),
            dec!(1.10000),
            CS,
            FillIntent::Close { position_id: None },
        );
        assert_eq!(app.net_delta, dec!(-100000));
        assert_eq!(app.gross_delta, dec!(-100000));
    }

    #[test]
    fn account_aggregates() {
        let book = book(MarginMode::Hedging);
        book.apply_fill("A", "EURUSD", Side::Buy, dec!(1), dec!(1.10020), CS, FillIntent::Open);
        book.apply_fill("A", "GBPUSD", Side::Buy, dec!(2), dec!(1.25000), CS, FillIntent::Open);
        book.mark("EURUSD", dec!(1.10120), dec!(1.10140));

        assert_eq!(book.open_count("A"), 2);
        assert_eq!(book.unrealized_for_account("A"), dec!(100.00000));
        // 1 * 100000 * 1.10020 + 2 * 100000 * 1.25
        assert_eq!(
            book.notional_for_account("A"),
            dec!(110020.00000) + dec!(250000)
        );
    }
}
