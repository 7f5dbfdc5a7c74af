// =============================================================================
// Circuit Breakers — automatic trading halts with cooldown recovery
// =============================================================================
//
// State machine per breaker:
//
//   armed -> triggered -> cooling -> armed
//                \-> disabled (manual)
//
// A breaker trips when its threshold is crossed (price movement fed by
// ticks, daily loss fed by account P&L) or when an operator trips it by
// hand. Once the halt has taken effect the breaker cools for its configured
// window, then re-arms. Every transition is reported to the caller so it
// can be journaled.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};

/// Lifecycle state of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Armed,
    Triggered,
    Cooling,
    Disabled,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Armed => write!(f, "armed"),
            Self::Triggered => write!(f, "triggered"),
            Self::Cooling => write!(f, "cooling"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// What the breaker watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BreakerKind {
    /// Percentage move of the mid price against a rolling reference.
    PriceMovement,
    /// Account-currency daily loss.
    DailyLoss,
    /// Operator-controlled only.
    Manual,
}

/// What the breaker halts when tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerScope {
    Global,
    Symbol(String),
    Account(String),
}

impl BreakerScope {
    /// Whether an order on (symbol, account) falls under this scope.
    pub fn covers(&self, symbol: &str, account_id: &str) -> bool {
        match self {
            Self::Global => true,
            Self::Symbol(s) => s == symbol,
            Self::Account(a) => a == account_id,
        }
    }
}

/// One configured breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breaker {
    pub name: String,
    pub kind: BreakerKind,
    pub scope: BreakerScope,
    /// Percent for price movement, account currency for daily loss.
    pub threshold: Decimal,
    pub state: BreakerState,
    pub cooldown_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooling_since: Option<u64>,
}

/// A journaled state change.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: u64,
}

// =============================================================================
// Panel
// =============================================================================

/// All breakers plus the per-symbol price references the movement breakers
/// measure against.
pub struct BreakerPanel {
    breakers: RwLock<Vec<Breaker>>,
    reference_prices: RwLock<HashMap<String, Decimal>>,
    clock: SharedClock,
}

impl BreakerPanel {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            breakers: RwLock::new(Vec::new()),
            reference_prices: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn install(&self, breaker: Breaker) {
        info!(name = %breaker.name, state = %breaker.state, "breaker installed");
        let mut breakers = self.breakers.write();
        breakers.retain(|b| b.name != breaker.name);
        breakers.push(breaker);
    }

    pub fn all(&self) -> Vec<Breaker> {
        self.breakers.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Breaker> {
        self.breakers.read().iter().find(|b| b.name == name).cloned()
    }

    /// Whether any triggered breaker covers the given order key. New orders
    /// are refused only while the breaker is in `triggered`.
    pub fn blocks(&self, symbol: &str, account_id: &str) -> Option<String> {
        self.breakers
            .read()
            .iter()
            .find(|b| b.state == BreakerState::Triggered && b.scope.covers(symbol, account_id))
            .map(|b| b.name.clone())
    }

    /// Whether resting-order activation stays suspended: true through both
    /// the halt and its cooldown.
    pub fn suspends(&self, symbol: &str, account_id: &str) -> Option<String> {
        self.breakers
            .read()
            .iter()
            .find(|b| {
                matches!(b.state, BreakerState::Triggered | BreakerState::Cooling)
                    && b.scope.covers(symbol, account_id)
            })
            .map(|b| b.name.clone())
    }

    // -------------------------------------------------------------------------
    // Automatic evaluation
    // -------------------------------------------------------------------------

    /// Feed a mid price. The first observation per symbol becomes the
    /// movement reference; later ticks trip any armed movement breaker whose
    /// threshold percentage the move exceeds.
    pub fn on_price(&self, symbol: &str, mid: Decimal) -> Vec<BreakerTransition> {
        let reference = {
            let mut refs = self.reference_prices.write();
            *refs.entry(symbol.to_string()).or_insert(mid)
        };
        if reference.is_zero() {
            return Vec::new();
        }

        let move_pct = ((mid - reference).abs() / reference * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0);

        let now = self.clock.now_ms();
        let mut transitions = Vec::new();
        let mut breakers = self.breakers.write();
        for b in breakers.iter_mut() {
            if b.kind == BreakerKind::PriceMovement
                && b.state == BreakerState::Armed
                && b.scope.covers(symbol, "")
                && move_pct >= b.threshold.to_f64().unwrap_or(f64::INFINITY)
            {
                warn!(name = %b.name, symbol, move_pct, "price movement breaker tripped");
                transitions.push(trip(b, now));
            }
        }
        transitions
    }

    /// Feed an account's current daily loss (positive number = loss).
    pub fn on_daily_loss(&self, account_id: &str, loss: Decimal) -> Vec<BreakerTransition> {
        let now = self.clock.now_ms();
        let mut transitions = Vec::new();
        let mut breakers = self.breakers.write();
        for b in breakers.iter_mut() {
            if b.kind == BreakerKind::DailyLoss
                && b.state == BreakerState::Armed
                && b.scope.covers("", account_id)
                && loss >= b.threshold
            {
                warn!(name = %b.name, account_id, loss = %loss, "daily loss breaker tripped");
                transitions.push(trip(b, now));
            }
        }
        transitions
    }

    /// Reset the movement reference (daily rollover).
    pub fn reset_references(&self) {
        self.reference_prices.write().clear();
    }

    // -------------------------------------------------------------------------
    // Manual control
    // -------------------------------------------------------------------------

    /// Operator-forced trip.
    pub fn trip_manual(&self, name: &str) -> Option<BreakerTransition> {
        let now = self.clock.now_ms();
        let mut breakers = self.breakers.write();
        let b = breakers.iter_mut().find(|b| b.name == name)?;
        if b.state == BreakerState::Triggered || b.state == BreakerState::Disabled {
            return None;
        }
        warn!(name, "breaker tripped manually");
        Some(trip(b, now))
    }

    /// Operator-forced re-arm from any state.
    pub fn reset_manual(&self, name: &str) -> Option<BreakerTransition> {
        let now = self.clock.now_ms();
        let mut breakers = self.breakers.write();
        let b = breakers.iter_mut().find(|b| b.name == name)?;
        if b.state == BreakerState::Armed {
            return None;
        }
        let from = b.state;
        b.state = BreakerState::Armed;
        b.triggered_at = None;
        b.cooling_since = None;
        info!(name, "breaker reset manually");
        Some(BreakerTransition {
            name: b.name.clone(),
            from,
            to: BreakerState::Armed,
            at: now,
        })
    }

    // -------------------------------------------------------------------------
    // Cooldown sweep
    // -------------------------------------------------------------------------

    /// Advance triggered breakers into cooling (the halt has been applied by
    /// the time the sweep runs) and re-arm cooled ones.
    pub fn sweep(&self) -> Vec<BreakerTransition> {
        let now = self.clock.now_ms();
        let mut transitions = Vec::new();
        let mut breakers = self.breakers.write();

        for b in breakers.iter_mut() {
            match b.state {
                BreakerState::Triggered => {
                    b.state = BreakerState::Cooling;
                    b.cooling_since = Some(now);
                    transitions.push(BreakerTransition {
                        name: b.name.clone(),
                        from: BreakerState::Triggered,
                        to: BreakerState::Cooling,
                        at: now,
                    });
                }
                BreakerState::Cooling => {
                    let since = b.cooling_since.unwrap_or(now);
                    if now.saturating_sub(since) >= b.cooldown_ms {
                        b.state = BreakerState::Armed;
                        b.triggered_at = None;
                        b.cooling_since = None;
                        info!(name = %b.name, "breaker re-armed after cooldown");
                        transitions.push(BreakerTransition {
                            name: b.name.clone(),
                            from: BreakerState::Cooling,
                            to: BreakerState::Armed,
                            at: now,
                        });
                    }
                }
                _ => {}
            }
        }

        transitions
    }
}

fn trip(b: &mut Breaker, now: u64) -> BreakerTransition {
    let from = b.state;
    b.state = BreakerState::Triggered;
    b.triggered_at = Some(now);
    BreakerTransition {
        name: b.name.clone(),
        from,
        to: BreakerState::Triggered,
        at: now,
    }
}

impl std::fmt::Debug for BreakerPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPanel")
            .field("breakers", &self.breakers.read().len())
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

    fn panel() -> (BreakerPanel, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let panel = BreakerPanel::new(clock.clone());
        (panel, clock)
    }

    fn movement_breaker(name: &str, symbol: &str, pct: Decimal) -> Breaker {
        Breaker {
            name: name.to_string(),
            kind: BreakerKind::PriceMovement,
            scope: BreakerScope::Symbol(symbol.to_string()),
            threshold: pct,
            state: BreakerState::Armed,
            cooldown_ms: 60_000,
            triggered_at: None,
            cooling_since: None,
        }
    }

    #[test]
    fn price_movement_trips_at_threshold() {
        let (panel, _) = panel();
        panel.install(movement_breaker("eurusd-3pct", "EURUSD", dec!(3)));

        // First tick sets the reference.
        assert!(panel.on_price("EURUSD", dec!(1.10000)).is_empty());
        // A 2% move stays armed.
        assert!(panel.on_price("EURUSD", dec!(1.12100)).is_empty());
        // A 3% move trips.
        let transitions = panel.on_price("EURUSD", dec!(1.13300));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, BreakerState::Triggered);
        assert_eq!(panel.blocks("EURUSD", "A"), Some("eurusd-3pct".to_string()));
    }

    #[test]
    fn scope_limits_blocking() {
        let (panel, _) = panel();
        panel.install(movement_breaker("eurusd-3pct", "EURUSD", dec!(3)));
        panel.on_price("EURUSD", dec!(1.0));
        panel.on_price("EURUSD", dec!(1.05));

        assert!(panel.blocks("EURUSD", "A").is_some());
        assert!(panel.blocks("GBPUSD", "A").is_none());
    }

    #[test]
    fn cooldown_cycle_rearms() {
        let (panel, clock) = panel();
        panel.install(movement_breaker("eurusd-3pct", "EURUSD", dec!(3)));
        panel.on_price("EURUSD", dec!(1.0));
        panel.on_price("EURUSD", dec!(1.04));
        assert_eq!(panel.get("eurusd-3pct").unwrap().state, BreakerState::Triggered);

        // First sweep: triggered -> cooling.
        let t = panel.sweep();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, BreakerState::Cooling);
        // New orders pass again (only triggered blocks), but resting-order
        // activation stays suspended through the cooldown.
        assert!(panel.blocks("EURUSD", "A").is_none());
        assert!(panel.suspends("EURUSD", "A").is_some());

        // Cooldown not elapsed: no change.
        clock.advance(30_000);
        assert!(panel.sweep().is_empty());

        // Past the cooldown: re-armed.
        clock.advance(30_000);
        let t = panel.sweep();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, BreakerState::Armed);
        assert!(panel.suspends("EURUSD", "A").is_none());
    }

    #[test]
    fn daily_loss_breaker() {
        let (panel, _) = panel();
        panel.install(Breaker {
            name: "acct-loss".to_string(),
            kind: BreakerKind::DailyLoss,
            scope: BreakerScope::Account("A".to_string()),
            threshold: dec!(500),
            state: BreakerState::Armed,
            cooldown_ms: 60_000,
            triggered_at: None,
            cooling_since: None,
        });

        assert!(panel.on_daily_loss("A", dec!(499)).is_empty());
        let t = panel.on_daily_loss("A", dec!(500));
        assert_eq!(t.len(), 1);
        assert!(panel.blocks("EURUSD", "A").is_some());
        assert!(panel.blocks("EURUSD", "B").is_none());
    }

    #[test]
    fn manual_trip_and_reset() {
        let (panel, _) = panel();
        panel.install(Breaker {
            name: "kill".to_string(),
            kind: BreakerKind::Manual,
            scope: BreakerScope::Global,
            threshold: Decimal::ZERO,
            state: BreakerState::Armed,
            cooldown_ms: 0,
            triggered_at: None,
            cooling_since: None,
        });

        let t = panel.trip_manual("kill").unwrap();
        assert_eq!(t.to, BreakerState::Triggered);
        assert!(panel.blocks("ANY", "ANY").is_some());
        // Double trip is a no-op.
        assert!(panel.trip_manual("kill").is_none());

        let t = panel.reset_manual("kill").unwrap();
        assert_eq!(t.to, BreakerState::Armed);
        assert!(panel.blocks("ANY", "ANY").is_none());
    }
}
