// =============================================================================
// Exit Watcher — tick-driven marks, protective exits, and resting orders
// =============================================================================
//
// One watcher task runs per symbol. Every best-quote tick:
//   1. re-marks open positions (bid for longs, ask for shorts),
//   2. feeds price-movement breakers,
//   3. ratchets trailing stops and fires SL/TP closes,
//   4. wakes resting stop/limit orders whose condition now holds.
//
// A slow watcher lags the quote stream and simply skips to the freshest
// quote; protective levels are always evaluated against the latest book.
// =============================================================================

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::breakers::BreakerPanel;
use crate::dispatcher::Dispatcher;
use crate::journal::{EventKind, Journal};
use crate::market_data::QuoteBoard;
use crate::oms::PositionBook;

/// Drive one symbol's tick-driven work until the quote stream closes.
pub async fn run_symbol_watcher(
    symbol: String,
    quotes: Arc<QuoteBoard>,
    positions: Arc<PositionBook>,
    breakers: Arc<BreakerPanel>,
    dispatcher: Arc<Dispatcher>,
    journal: Arc<Journal>,
) {
    let mut rx = quotes.subscribe(&symbol);
    info!(symbol = %symbol, "exit watcher started");

    loop {
        let best = match rx.recv().await {
            Ok(best) => best,
            Err(RecvError::Lagged(skipped)) => {
                debug!(symbol = %symbol, skipped, "watcher lagged, catching up");
                continue;
            }
            Err(RecvError::Closed) => {
                warn!(symbol = %symbol, "quote stream closed, watcher stopping");
                break;
            }
        };

        positions.mark(&symbol, best.bid, best.ask);

        // Equity follows the marks for every account holding this symbol.
        let touched: std::collections::HashSet<String> = positions
            .open_positions()
            .iter()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.account_id.clone())
            .collect();
        for account_id in touched {
            dispatcher.refresh_account_marks(&account_id);
        }

        for t in breakers.on_price(&symbol, best.mid()) {
            let _ = journal.append(
                EventKind::BreakerTransition,
                serde_json::json!({ "name": t.name, "from": t.from, "to": t.to }),
            );
        }

        let triggers = positions.check_exits(&symbol, best.bid, best.ask);
        for trigger in &triggers {
            dispatcher.execute_exit(trigger).await;
        }

        dispatcher.on_tick(&symbol, &best).await;
    }
}

/// Flag marks stale for any symbol whose market has gone dark, on an
/// interval.
pub async fn run_stale_monitor(
    quotes: Arc<QuoteBoard>,
    positions: Arc<PositionBook>,
    interval_ms: u64,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
    loop {
        ticker.tick().await;
        for symbol in quotes.symbols() {
            if !quotes.has_market(&symbol) {
                positions.flag_stale(&symbol);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Account, AccountBook};
    use crate::clock::{Clock, ManualClock, SharedClock};
    use crate::config::EngineConfig;
    use crate::events::EventHub;
    use crate::exposure::ExposureEngine;
    use crate::instruments::InstrumentRegistry;
    use crate::lp::SessionManager;
    use crate::market_data::Quote;
    use crate::oms::{FillIntent, OrderStore};
    use crate::profile::ClientProfileStore;
    use crate::risk::RiskEngine;
    use crate::types::{MarginMode, Side};
    use rust_decimal_macros::dec;

    const NOW: u64 = 1_700_000_000_000;

    fn publish(quotes: &QuoteBoard, clock: &ManualClock, bid: &str, ask: &str, seq: u64) {
        quotes.publish(Quote {
            symbol: "EURUSD".to_string(),
            bid: bid.parse().unwrap(),
            ask: ask.parse().unwrap(),
            bid_size: dec!(1000000),
            ask_size: dec!(1000000),
            lp: "LP-X".to_string(),
            seq,
            ts: clock.now_ms(),
        });
    }

    #[tokio::test]
    async fn watcher_closes_position_through_stop() {
        let clock = Arc::new(ManualClock::new(NOW));
        let shared: SharedClock = clock.clone();
        let config = EngineConfig::default();

        let registry = Arc::new(InstrumentRegistry::with_fx_defaults(&config.symbols));
        let accounts = Arc::new(AccountBook::new());
        accounts.upsert(Account::new("A", dec!(100000), dec!(100)));
        let quotes = Arc::new(QuoteBoard::new(shared.clone(), config.quote_stale_ttl_ms));
        let sessions = Arc::new(SessionManager::new());
        let exposure = Arc::new(ExposureEngine::new(dec!(0.01)));
        let breakers = Arc::new(BreakerPanel::new(shared.clone()));
        let orders = Arc::new(OrderStore::new(shared.clone()));
        let positions = Arc::new(PositionBook::new(MarginMode::Hedging, shared.clone()));
        let journal = Arc::new(Journal::in_memory(shared.clone()));
        let events = Arc::new(EventHub::new());
        let risk = Arc::new(RiskEngine::new(
            accounts.clone(),
            positions.clone(),
            breakers.clone(),
            config.max_open_positions_per_account,
            config.daily_loss_limit,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            shared,
            registry,
            accounts,
            Arc::new(ClientProfileStore::new()),
            quotes.clone(),
            sessions,
            exposure,
            risk,
            breakers.clone(),
            orders,
            positions.clone(),
            journal.clone(),
            events,
        ));

        // Open a protected long directly in the book.
        let app = positions.apply_fill(
            "A",
            "EURUSD",
            Side::Buy,
            dec!(1),
            dec!(1.10020),
            dec!(100000),
            FillIntent::Open,
        );
        positions
            .set_protections(&app.opened[0], Some(dec!(1.09900)), None, None)
            .unwrap();

        let handle = tokio::spawn(run_symbol_watcher(
            "EURUSD".to_string(),
            quotes.clone(),
            positions.clone(),
            breakers,
            dispatcher,
            journal,
        ));

        // A benign tick, then one through the stop.
        publish(&quotes, &clock, "1.10010", "1.10030", 1);
        publish(&quotes, &clock, "1.09899", "1.09919", 2);

        // Give the watcher a few turns to consume both ticks.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if positions.positions_for_account("A").is_empty() {
                break;
            }
        }

        assert!(positions.positions_for_account("A").is_empty());
        let closed = positions.get(&app.opened[0]).unwrap();
        assert_eq!(closed.realized_pnl, dec!(-121.00000));
        handle.abort();
    }
}
