// =============================================================================
// Exposure Engine — aggregate net/gross limits per (symbol, scope)
// =============================================================================
//
// Counters track net exposure (signed sum of position sizes in contract
// units) and gross exposure (sum of absolute sizes) per (symbol, scope,
// scope id). Orders are checked pre-trade against the hypothetical counters
// they would produce; fills update the counters post-trade in the same
// serialized path that applied the position change, so observations are
// consistent with fill order.
//
// A periodic reconciliation recomputes every counter from the authoritative
// position book. Divergence flips the affected key into safe mode, where all
// limits read as breached, until a clean pass clears it.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::oms::Position;
use crate::types::Side;

/// Aggregation scope of a limit or counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Lp,
    Account,
    User,
    Instrument,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Lp => write!(f, "lp"),
            Self::Account => write!(f, "account"),
            Self::User => write!(f, "user"),
            Self::Instrument => write!(f, "instrument"),
        }
    }
}

/// What to do when a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    Alert,
    Warn,
    Hedge,
    Reduce,
    Reject,
}

/// One configured exposure limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureLimit {
    pub symbol: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub max_net: Decimal,
    pub max_gross: Decimal,
    /// Percentage of a limit at which a warning event fires.
    pub warn_pct: u8,
    pub action: LimitAction,
    /// Fraction of breaching flow hedged out when `action` is `hedge`.
    #[serde(default)]
    pub hedge_pct: u8,
}

impl ExposureLimit {
    pub fn is_valid(&self) -> bool {
        self.max_gross >= self.max_net
            && self.max_net >= Decimal::ZERO
            && self.warn_pct <= 100
            && self.hedge_pct <= 100
    }
}

/// Counter key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExposureKey {
    pub symbol: String,
    pub scope: Scope,
    pub scope_id: Option<String>,
}

/// Current counters for one key.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    pub net: Decimal,
    pub gross: Decimal,
}

/// Pre-trade verdict.
#[derive(Debug, Clone)]
pub enum ExposureVerdict {
    /// Within every applicable limit.
    Accept,
    /// Accepted, but the configured share must be hedged externally.
    AcceptWithHedge { hedge_pct: u8 },
    /// Accepted at a smaller size that stays inside the limit.
    Reduce { new_qty: Decimal },
    /// Hard breach with `reject` action.
    Reject,
}

/// Utilization details surfaced with routing decisions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExposureImpact {
    pub utilization_before_pct: f64,
    pub utilization_after_pct: f64,
}

/// Events emitted for the journal and subscribers.
#[derive(Debug, Clone, Serialize)]
pub enum ExposureEvent {
    Warning {
        key: ExposureKey,
        utilization_pct: f64,
    },
    Breach {
        key: ExposureKey,
        utilization_pct: f64,
        action: LimitAction,
    },
    HedgeRequest {
        symbol: String,
        hedge_pct: u8,
        qty: Decimal,
    },
    SafeMode {
        key: ExposureKey,
        entered: bool,
    },
}

// =============================================================================
// Engine
// =============================================================================

struct Inner {
    counters: HashMap<ExposureKey, Counters>,
    limits: Vec<ExposureLimit>,
    safe_mode: HashSet<ExposureKey>,
}

/// Single-writer exposure ledger; every mutation flows through `&self`
/// methods that serialize on the inner lock.
pub struct ExposureEngine {
    inner: RwLock<Inner>,
    /// Smallest tradable quantity step for `reduce` sizing.
    min_qty_step: Decimal,
}

impl ExposureEngine {
    pub fn new(min_qty_step: Decimal) -> Self {
        Self {
            inner: RwLock::new(Inner {
                counters: HashMap::new(),
                limits: Vec::new(),
                safe_mode: HashSet::new(),
            }),
            min_qty_step,
        }
    }

    /// Replace the limit set (admin CRUD path). Invalid limits are dropped.
    pub fn set_limits(&self, limits: Vec<ExposureLimit>) {
        let (valid, invalid): (Vec<_>, Vec<_>) = limits.into_iter().partition(|l| l.is_valid());
        if !invalid.is_empty() {
            warn!(count = invalid.len(), "invalid exposure limits dropped");
        }
        info!(count = valid.len(), "exposure limits installed");
        self.inner.write().limits = valid;
    }

    pub fn limits(&self) -> Vec<ExposureLimit> {
        self.inner.read().limits.clone()
    }

    /// Counters for a key, zero when untouched.
    pub fn counters(&self, key: &ExposureKey) -> Counters {
        self.inner
            .read()
            .counters
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    fn keys_for(symbol: &str, account_id: &str, lp: Option<&str>) -> Vec<ExposureKey> {
        let mut keys = vec![
            ExposureKey {
                symbol: symbol.to_string(),
                scope: Scope::Global,
                scope_id: None,
            },
            ExposureKey {
                symbol: symbol.to_string(),
                scope: Scope::Account,
                scope_id: Some(account_id.to_string()),
            },
            ExposureKey {
                symbol: symbol.to_string(),
                scope: Scope::Instrument,
                scope_id: None,
            },
        ];
        if let Some(lp) = lp {
            keys.push(ExposureKey {
                symbol: symbol.to_string(),
                scope: Scope::Lp,
                scope_id: Some(lp.to_string()),
            });
        }
        keys
    }

    fn limit_applies(limit: &ExposureLimit, key: &ExposureKey) -> bool {
        limit.symbol == key.symbol
            && limit.scope == key.scope
            && match (&limit.scope_id, &key.scope_id) {
                (None, _) => true,
                (Some(a), Some(b)) => a == b,
                (Some(_), None) => false,
            }
    }

    /// Utilization of the worse of the two limits, as a percentage.
    fn utilization(limit: &ExposureLimit, net: Decimal, gross: Decimal) -> f64 {
        let net_part = if limit.max_net.is_zero() {
            if net.is_zero() {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (net.abs() / limit.max_net).to_f64().unwrap_or(f64::INFINITY)
        };
        let gross_part = if limit.max_gross.is_zero() {
            if gross.is_zero() {
                0.0
            } else {
                f64::INFINITY
            }
        } else {
            (gross / limit.max_gross).to_f64().unwrap_or(f64::INFINITY)
        };
        net_part.max(gross_part) * 100.0
    }

    // -------------------------------------------------------------------------
    // Pre-trade
    // -------------------------------------------------------------------------

    /// Evaluate an order intent against every applicable limit.
    ///
    /// The hypothetical counters assume the full quantity adds to gross and
    /// moves net in the order's direction (worst case for limit purposes).
    /// Returns the verdict, the impact for the decision audit, and any
    /// events to journal.
    pub fn pre_trade(
        &self,
        symbol: &str,
        account_id: &str,
        lp: Option<&str>,
        side: Side,
        qty: Decimal,
        contract_size: Decimal,
    ) -> (ExposureVerdict, ExposureImpact, Vec<ExposureEvent>) {
        let inner = self.inner.read();
        let delta = qty * contract_size;
        let mut events = Vec::new();
        let mut impact = ExposureImpact::default();
        let mut verdict = ExposureVerdict::Accept;

        for key in Self::keys_for(symbol, account_id, lp) {
            if inner.safe_mode.contains(&key) {
                warn!(symbol, scope = %key.scope, "exposure key in safe mode, treating limits as reached");
                return (
                    ExposureVerdict::Reject,
                    impact,
                    vec![ExposureEvent::Breach {
                        key,
                        utilization_pct: 100.0,
                        action: LimitAction::Reject,
                    }],
                );
            }

            let counters = inner.counters.get(&key).copied().unwrap_or_default();
            let net_after = counters.net + side.sign() * delta;
            let gross_after = counters.gross + delta;

            for limit in inner.limits.iter().filter(|l| Self::limit_applies(l, &key)) {
                let before = Self::utilization(limit, counters.net, counters.gross);
                let after = Self::utilization(limit, net_after, gross_after);
                impact.utilization_before_pct = impact.utilization_before_pct.max(before);
                impact.utilization_after_pct = impact.utilization_after_pct.max(after);

                if after >= 100.0 {
                    match limit.action {
                        LimitAction::Reject => {
                            events.push(ExposureEvent::Breach {
                                key: key.clone(),
                                utilization_pct: after,
                                action: limit.action,
                            });
                            return (ExposureVerdict::Reject, impact, events);
                        }
                        LimitAction::Hedge => {
                            events.push(ExposureEvent::HedgeRequest {
                                symbol: symbol.to_string(),
                                hedge_pct: limit.hedge_pct,
                                qty,
                            });
                            verdict = ExposureVerdict::AcceptWithHedge {
                                hedge_pct: limit.hedge_pct,
                            };
                        }
                        LimitAction::Reduce => {
                            let new_qty = self.reduced_qty(limit, &counters, side, contract_size);
                            events.push(ExposureEvent::Breach {
                                key: key.clone(),
                                utilization_pct: after,
                                action: limit.action,
                            });
                            verdict = ExposureVerdict::Reduce { new_qty };
                        }
                        LimitAction::Warn | LimitAction::Alert => {
                            events.push(ExposureEvent::Breach {
                                key: key.clone(),
                                utilization_pct: after,
                                action: limit.action,
                            });
                        }
                    }
                } else if after >= limit.warn_pct as f64 && before < limit.warn_pct as f64 {
                    events.push(ExposureEvent::Warning {
                        key: key.clone(),
                        utilization_pct: after,
                    });
                }
            }
        }

        (verdict, impact, events)
    }

    /// Largest quantity (multiple of the minimum step) that keeps both
    /// limits strictly below 100 % utilization.
    fn reduced_qty(
        &self,
        limit: &ExposureLimit,
        counters: &Counters,
        side: Side,
        contract_size: Decimal,
    ) -> Decimal {
        if contract_size.is_zero() {
            return Decimal::ZERO;
        }

        // Headroom in contract units on each constraint.
        let net_after_sign = side.sign();
        let net_headroom = if net_after_sign > Decimal::ZERO {
            limit.max_net - counters.net
        } else {
            limit.max_net + counters.net
        };
        let gross_headroom = limit.max_gross - counters.gross;
        let headroom = net_headroom.min(gross_headroom).max(Decimal::ZERO);

        let raw_qty = headroom / contract_size;
        if self.min_qty_step.is_zero() {
            return raw_qty;
        }
        let steps = (raw_qty / self.min_qty_step).floor();
        (steps * self.min_qty_step).max(Decimal::ZERO)
    }

    // -------------------------------------------------------------------------
    // Post-trade
    // -------------------------------------------------------------------------

    /// Apply the aggregate effect of a fill to every key it touches.
    /// Returns breach events for thresholds crossed upward.
    pub fn apply_fill(
        &self,
        symbol: &str,
        account_id: &str,
        lp: Option<&str>,
        net_delta: Decimal,
        gross_delta: Decimal,
    ) -> Vec<ExposureEvent> {
        let mut inner = self.inner.write();
        let mut events = Vec::new();

        for key in Self::keys_for(symbol, account_id, lp) {
            let counters = inner.counters.entry(key.clone()).or_default();
            let before = *counters;
            counters.net += net_delta;
            counters.gross += gross_delta;
            let after = *counters;

            for limit in inner
                .limits
                .iter()
                .filter(|l| Self::limit_applies(l, &key))
            {
                let before_pct = Self::utilization(limit, before.net, before.gross);
                let after_pct = Self::utilization(limit, after.net, after.gross);
                if after_pct >= 100.0 && before_pct < 100.0 {
                    events.push(ExposureEvent::Breach {
                        key: key.clone(),
                        utilization_pct: after_pct,
                        action: limit.action,
                    });
                } else if after_pct >= limit.warn_pct as f64
                    && before_pct < limit.warn_pct as f64
                {
                    events.push(ExposureEvent::Warning {
                        key: key.clone(),
                        utilization_pct: after_pct,
                    });
                }
            }
        }

        events
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Recompute every counter from the authoritative open positions.
    /// Divergent keys enter safe mode; matching keys leave it.
    pub fn reconcile(&self, positions: &[Position]) -> Vec<ExposureEvent> {
        let mut recomputed: HashMap<ExposureKey, Counters> = HashMap::new();

        for pos in positions.iter().filter(|p| p.is_open()) {
            let size = pos.qty() * pos.contract_size;
            let signed = pos.side.sign() * size;
            for key in Self::keys_for(&pos.symbol, &pos.account_id, None) {
                let c = recomputed.entry(key).or_default();
                c.net += signed;
                c.gross += size;
            }
        }

        let mut events = Vec::new();
        let mut inner = self.inner.write();

        // Every key we track or just recomputed must agree.
        let mut all_keys: HashSet<ExposureKey> = inner.counters.keys().cloned().collect();
        all_keys.extend(recomputed.keys().cloned());

        for key in all_keys {
            // LP-scope counters track routed flow, not positions; they are
            // not recomputable from the book and are skipped here.
            if key.scope == Scope::Lp {
                continue;
            }
            let actual = recomputed.get(&key).copied().unwrap_or_default();
            let tracked = inner.counters.get(&key).copied().unwrap_or_default();

            if tracked.net != actual.net || tracked.gross != actual.gross {
                warn!(
                    symbol = %key.symbol,
                    scope = %key.scope,
                    tracked_net = %tracked.net,
                    actual_net = %actual.net,
                    "exposure counter drift, entering safe mode"
                );
                inner.counters.insert(key.clone(), actual);
                if inner.safe_mode.insert(key.clone()) {
                    events.push(ExposureEvent::SafeMode {
                        key,
                        entered: true,
                    });
                }
            } else if inner.safe_mode.remove(&key) {
                info!(symbol = %key.symbol, scope = %key.scope, "exposure key reconciled, safe mode cleared");
                events.push(ExposureEvent::SafeMode {
                    key,
                    entered: false,
                });
            }
        }

        events
    }

    /// Rebuild every counter from scratch (startup restore). Unlike
    /// `reconcile`, this is initialization, not drift detection: safe mode
    /// clears and no events fire.
    pub fn rebuild(&self, positions: &[Position]) {
        let mut recomputed: HashMap<ExposureKey, Counters> = HashMap::new();
        for pos in positions.iter().filter(|p| p.is_open()) {
            let size = pos.qty() * pos.contract_size;
            let signed = pos.side.sign() * size;
            for key in Self::keys_for(&pos.symbol, &pos.account_id, None) {
                let c = recomputed.entry(key).or_default();
                c.net += signed;
                c.gross += size;
            }
        }
        let mut inner = self.inner.write();
        inner.counters = recomputed;
        inner.safe_mode.clear();
        info!(keys = inner.counters.len(), "exposure counters rebuilt from positions");
    }

    /// Whether any key is currently in safe mode.
    pub fn safe_mode_keys(&self) -> Vec<ExposureKey> {
        self.inner.read().safe_mode.iter().cloned().collect()
    }

    /// Dashboard snapshot of all non-zero counters.
    pub fn snapshot(&self) -> Vec<(ExposureKey, Counters)> {
        let inner = self.inner.read();
        let mut entries: Vec<(ExposureKey, Counters)> = inner
            .counters
            .iter()
            .filter(|(_, c)| !c.net.is_zero() || !c.gross.is_zero())
            .map(|(k, c)| (k.clone(), *c))
            .collect();
        entries.sort_by(|a, b| {
            (&a.0.symbol, a.0.scope.to_string()).cmp(&(&b.0.symbol, b.0.scope.to_string()))
        });
        entries
    }
}

impl std::fmt::Debug for ExposureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ExposureEngine")
            .field("counters", &inner.counters.len())
            .field("limits", &inner.limits.len())
            .field("safe_mode", &inner.safe_mode.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
