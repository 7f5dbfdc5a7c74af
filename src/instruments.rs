// =============================================================================
// Instrument Registry — static reference data, swap-on-reload
// =============================================================================
//
// Instruments are immutable after load. The registry holds them behind an
// `Arc` snapshot that readers clone cheaply; a reload builds a fresh map and
// swaps it in one write, so in-flight readers keep a consistent view.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Timelike, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Daily trading window in minutes after midnight UTC. `open == close`
/// means 24h trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingHours {
    pub open_minute: u32,
    pub close_minute: u32,
}

impl Default for TradingHours {
    fn default() -> Self {
        // 24h market.
        Self {
            open_minute: 0,
            close_minute: 0,
        }
    }
}

impl TradingHours {
    /// Whether the window contains the given minute of day.
    pub fn contains(&self, minute_of_day: u32) -> bool {
        if self.open_minute == self.close_minute {
            return true;
        }
        if self.open_minute < self.close_minute {
            (self.open_minute..self.close_minute).contains(&minute_of_day)
        } else {
            // Window wraps midnight.
            minute_of_day >= self.open_minute || minute_of_day < self.close_minute
        }
    }
}

/// Static reference data for one tradable symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: Decimal,
    pub contract_size: Decimal,
    /// Price units per pip (10_000 for 4/5-digit FX pairs).
    pub pip_factor: Decimal,
    pub max_leverage: Decimal,
    #[serde(default)]
    pub trading_hours: TradingHours,
    /// Administratively disabled symbols reject all orders.
    #[serde(default)]
    pub disabled: bool,
}

impl Instrument {
    /// Standard FX instrument used by defaults and tests.
    pub fn fx(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            tick_size: Decimal::new(1, 5), // 0.00001
            contract_size: Decimal::new(100_000, 0),
            pip_factor: Decimal::new(10_000, 0),
            max_leverage: Decimal::new(100, 0),
            trading_hours: TradingHours::default(),
            disabled: false,
        }
    }

    /// One pip expressed in price units.
    pub fn pip(&self) -> Decimal {
        if self.pip_factor.is_zero() {
            Decimal::ZERO
        } else {
            Decimal::ONE / self.pip_factor
        }
    }

    /// Whether the instrument accepts orders at `now_ms` (epoch millis UTC).
    pub fn tradable_at(&self, now_ms: u64) -> bool {
        if self.disabled {
            return false;
        }
        let minute = minute_of_day_utc(now_ms);
        self.trading_hours.contains(minute)
    }
}

fn minute_of_day_utc(now_ms: u64) -> u32 {
    let dt = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    dt.hour() * 60 + dt.minute()
}

// =============================================================================
// Registry
// =============================================================================

/// Read-mostly instrument store. Lookups return the shared snapshot; reloads
/// swap the whole map atomically.
pub struct InstrumentRegistry {
    snapshot: RwLock<Arc<HashMap<String, Instrument>>>,
}

impl InstrumentRegistry {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let map: HashMap<String, Instrument> = instruments
            .into_iter()
            .map(|i| (i.symbol.clone(), i))
            .collect();
        info!(count = map.len(), "instrument registry loaded");
        Self {
            snapshot: RwLock::new(Arc::new(map)),
        }
    }

    /// Default FX instruments for the configured symbols.
    pub fn with_fx_defaults(symbols: &[String]) -> Self {
        Self::new(symbols.iter().map(|s| Instrument::fx(s)).collect())
    }

    /// Look up a single instrument.
    pub fn get(&self, symbol: &str) -> Option<Instrument> {
        self.snapshot.read().get(symbol).cloned()
    }

    /// The current full snapshot; cheap to clone, consistent to iterate.
    pub fn all(&self) -> Arc<HashMap<String, Instrument>> {
        self.snapshot.read().clone()
    }

    /// Replace the whole registry in one step.
    pub fn reload(&self, instruments: Vec<Instrument>) {
        let map: HashMap<String, Instrument> = instruments
            .into_iter()
            .map(|i| (i.symbol.clone(), i))
            .collect();
        let count = map.len();
        *self.snapshot.write() = Arc::new(map);
        info!(count, "instrument registry reloaded");
    }
}

impl std::fmt::Debug for InstrumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentRegistry")
            .field("instruments", &self.snapshot.read().len())
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

    #[test]
    fn fx_instrument_defaults() {
        let eur = Instrument::fx("EURUSD");
        assert_eq!(eur.contract_size, dec!(100000));
        assert_eq!(eur.pip_factor, dec!(10000));
        assert_eq!(eur.pip(), dec!(0.0001));
        assert!(eur.tick_size > Decimal::ZERO);
    }

    #[test]
    fn trading_hours_full_day() {
        let hours = TradingHours::default();
        assert!(hours.contains(0));
        assert!(hours.contains(720));
        assert!(hours.contains(1439));
    }

    #[test]
    fn trading_hours_window() {
        let hours = TradingHours {
            open_minute: 8 * 60,
            close_minute: 17 * 60,
        };
        assert!(!hours.contains(7 * 60 + 59));
        assert!(hours.contains(8 * 60));
        assert!(hours.contains(12 * 60));
        assert!(!hours.contains(17 * 60));
    }

    #[test]
    fn trading_hours_wrapping_window() {
        let hours = TradingHours {
            open_minute: 22 * 60,
            close_minute: 6 * 60,
        };
        assert!(hours.contains(23 * 60));
        assert!(hours.contains(0));
        assert!(hours.contains(5 * 60 + 59));
        assert!(!hours.contains(12 * 60));
    }

    #[test]
    fn disabled_instrument_not_tradable() {
        let mut eur = Instrument::fx("EURUSD");
        assert!(eur.tradable_at(1_700_000_000_000));
        eur.disabled = true;
        assert!(!eur.tradable_at(1_700_000_000_000));
    }

    #[test]
    fn registry_lookup_and_reload() {
        let registry =
            InstrumentRegistry::with_fx_defaults(&["EURUSD".to_string(), "GBPUSD".to_string()]);
        assert!(registry.get("EURUSD").is_some());
        assert!(registry.get("XAUUSD").is_none());

        let snapshot_before = registry.all();
        registry.reload(vec![Instrument::fx("XAUUSD")]);
        assert!(registry.get("EURUSD").is_none());
        assert!(registry.get("XAUUSD").is_some());
        // Old snapshot stays intact for readers that captured it.
        assert!(snapshot_before.contains_key("EURUSD"));
    }
}
