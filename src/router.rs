// =============================================================================
// Order Router — rule evaluation and book placement
// =============================================================================
//
// Routing is a pure function of its inputs: the rule set (highest priority
// first), the client profile, venue health, and the exposure impact computed
// pre-trade. Identical inputs always produce the identical decision, which
// makes every routing choice reproducible from the journal.
//
// Rule actions: route out (a-book), internalize (b-book), split (hybrid),
// reject, hold, or alert (alert raises a compliance note and falls through
// to the next rule). When no rule matches, the client profile decides: a
// manual override wins, toxic flow above the cutoff is hedged out, and
// otherwise the per-order book split is drawn from the profile percentages
// by hashing the order identity.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::exposure::ExposureImpact;
use crate::instruments::TradingHours;
use crate::lp::LpHealth;
use crate::profile::ClientProfile;
use crate::types::{ExecutionPath, RejectReason, Side};

/// What a matched rule does with the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleAction {
    ABook,
    BBook,
    Hybrid,
    Reject,
    Hold,
    Alert,
}

/// One routing rule. All present filters must hold for a match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    /// Unique; higher evaluates first.
    pub priority: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_qty: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_qty: Option<Decimal>,
    /// Time-of-day window (UTC) the rule is valid in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TradingHours>,
    /// Matches only while projected utilization stays at or below this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_utilization_pct: Option<f64>,
    /// Matches only once projected utilization reaches this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_utilization_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_toxicity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_toxicity: Option<u8>,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge_pct: Option<u8>,
}

impl RoutingRule {
    fn matches(&self, inputs: &RouteInputs<'_>, minute_of_day: u32) -> bool {
        if !self.active {
            return false;
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.iter().any(|s| s == inputs.symbol) {
                return false;
            }
        }
        if let Some(accounts) = &self.accounts {
            if !accounts.iter().any(|a| a == inputs.account_id) {
                return false;
            }
        }
        if let Some(min) = self.min_qty {
            if inputs.qty < min {
                return false;
            }
        }
        if let Some(max) = self.max_qty {
            if inputs.qty > max {
                return false;
            }
        }
        if let Some(window) = &self.window {
            if !window.contains(minute_of_day) {
                return false;
            }
        }
        if let Some(max) = self.max_utilization_pct {
            if inputs.impact.utilization_after_pct > max {
                return false;
            }
        }
        if let Some(min) = self.min_utilization_pct {
            if inputs.impact.utilization_after_pct < min {
                return false;
            }
        }
        if let Some(min) = self.min_toxicity {
            if inputs.profile.toxicity_score < min {
                return false;
            }
        }
        if let Some(max) = self.max_toxicity {
            if inputs.profile.toxicity_score > max {
                return false;
            }
        }
        true
    }
}

/// Where the decision sends the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RoutePath {
    ABook,
    BBook,
    Hybrid,
    Reject,
    Hold,
}

/// The routing verdict, surfaced verbatim in API responses.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub path: RoutePath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lp_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hedge_pct: Option<u8>,
    /// Which rule or fallback produced the decision.
    pub reason: String,
    /// How strongly the winning choice dominated the alternatives. Display
    /// only, never used for execution.
    pub confidence: f64,
    pub exposure_before_pct: f64,
    pub exposure_after_pct: f64,
    /// Compliance alerts raised by alert rules on the way down.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<String>,
    /// Set when `path` is `Reject`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
}

/// Everything the router reads. The decision is a pure function of this.
#[derive(Debug, Clone)]
pub struct RouteInputs<'a> {
    pub account_id: &'a str,
    pub client_order_id: &'a str,
    pub symbol: &'a str,
    pub side: Side,
    pub qty: Decimal,
    pub minute_of_day: u32,
    pub profile: &'a ClientProfile,
    pub rules: &'a [RoutingRule],
    pub lp_health: &'a [LpHealth],
    pub impact: ExposureImpact,
    pub default_path: ExecutionPath,
    pub toxicity_cutoff: u8,
}

// =============================================================================
// Decision
// =============================================================================

/// Evaluate the rule set and profile for one order.
pub fn decide(inputs: &RouteInputs<'_>) -> RoutingDecision {
    let mut rules: Vec<&RoutingRule> = inputs.rules.iter().collect();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut alerts = Vec::new();
    let matched: Vec<&RoutingRule> = rules
        .iter()
        .copied()
        .filter(|r| r.matches(inputs, inputs.minute_of_day))
        .collect();
    // Alert rules fall through; the winner is the first non-alert match.
    let decisive: Vec<&RoutingRule> = matched
        .iter()
        .copied()
        .filter(|r| r.action != RuleAction::Alert)
        .collect();

    for rule in &matched {
        if rule.action == RuleAction::Alert {
            debug!(rule = %rule.name, "compliance alert rule matched");
            alerts.push(rule.name.clone());
        }
    }

    if let Some(rule) = decisive.first().copied() {
        // Confidence shrinks as more rules compete for the same order.
        let confidence = 1.0 / decisive.len() as f64;
        let reason = format!("rule:{}", rule.name);
        return finish_rule(inputs, rule, reason, confidence, alerts);
    }

    profile_fallback(inputs, alerts)
}

// --- Profile fallback --------------------------------------------------------

fn profile_fallback(inputs: &RouteInputs<'_>, alerts: Vec<String>) -> RoutingDecision {
    let profile = inputs.profile;

    if let Some(path) = profile.manual_override {
        let (path, lp, reject) = resolve_path(inputs, path);
        return RoutingDecision {
            path,
            lp_name: lp,
            hedge_pct: None,
            reason: "profile:manualOverride".to_string(),
            confidence: 1.0,
            exposure_before_pct: inputs.impact.utilization_before_pct,
            exposure_after_pct: inputs.impact.utilization_after_pct,
            alerts,
            reject_reason: reject,
        };
    }

    if profile.toxicity_score >= inputs.toxicity_cutoff {
        let (path, lp, reject) = resolve_path(inputs, ExecutionPath::ABook);
        return RoutingDecision {
            path,
            lp_name: lp,
            hedge_pct: None,
            reason: "profile:toxicity".to_string(),
            confidence: profile.toxicity_score as f64 / 100.0,
            exposure_before_pct: inputs.impact.utilization_before_pct,
            exposure_after_pct: inputs.impact.utilization_after_pct,
            alerts,
            reject_reason: reject,
        };
    }

    // Per-order draw from the profile split, derived from the order identity
    // so the same order always lands on the same book.
    let draw = split_draw(inputs.account_id, inputs.client_order_id);
    let (wanted, confidence) = if profile.a_book_pct > 0 && draw < profile.a_book_pct {
        (ExecutionPath::ABook, profile.a_book_pct as f64 / 100.0)
    } else if profile.b_book_pct > 0 {
        (ExecutionPath::BBook, profile.b_book_pct as f64 / 100.0)
    } else {
        (inputs.default_path, 0.5)
    };

    let (path, lp, reject) = resolve_path(inputs, wanted);
    RoutingDecision {
        path,
        lp_name: lp,
        hedge_pct: None,
        reason: "profile:split".to_string(),
        confidence,
        exposure_before_pct: inputs.impact.utilization_before_pct,
        exposure_after_pct: inputs.impact.utilization_after_pct,
        alerts,
        reject_reason: reject,
    }
}

fn finish_rule(
    inputs: &RouteInputs<'_>,
    rule: &RoutingRule,
    reason: String,
    confidence: f64,
    alerts: Vec<String>,
) -> RoutingDecision {
    let base = |path, lp_name, hedge_pct, reject_reason| RoutingDecision {
        path,
        lp_name,
        hedge_pct,
        reason: reason.clone(),
        confidence,
        exposure_before_pct: inputs.impact.utilization_before_pct,
        exposure_after_pct: inputs.impact.utilization_after_pct,
        alerts: alerts.clone(),
        reject_reason,
    };

    match rule.action {
        RuleAction::ABook => match pick_lp(inputs, rule.target_lp.as_deref()) {
            Some(lp) => base(RoutePath::ABook, Some(lp), None, None),
            None => base(
                RoutePath::Reject,
                None,
                None,
                Some(RejectReason::NoRouteAvailable),
            ),
        },
        RuleAction::BBook => base(RoutePath::BBook, None, None, None),
        RuleAction::Hybrid => {
            let hedge_pct = rule.hedge_pct.unwrap_or(50).min(100);
            match pick_lp(inputs, rule.target_lp.as_deref()) {
                Some(lp) => base(RoutePath::Hybrid, Some(lp), Some(hedge_pct), None),
                None => base(
                    RoutePath::Reject,
                    None,
                    None,
                    Some(RejectReason::NoRouteAvailable),
                ),
            }
        }
        RuleAction::Reject => base(
            RoutePath::Reject,
            None,
            None,
            Some(RejectReason::RoutingRejected),
        ),
        RuleAction::Hold => base(RoutePath::Hold, None, None, None),
        RuleAction::Alert => unreachable!("alert rules never decide"),
    }
}

/// Resolve a wanted path against venue availability.
fn resolve_path(
    inputs: &RouteInputs<'_>,
    wanted: ExecutionPath,
) -> (RoutePath, Option<String>, Option<RejectReason>) {
    match wanted {
        ExecutionPath::BBook => (RoutePath::BBook, None, None),
        ExecutionPath::ABook => match pick_lp(inputs, None) {
            Some(lp) => (RoutePath::ABook, Some(lp), None),
            None => (RoutePath::Reject, None, Some(RejectReason::NoRouteAvailable)),
        },
        ExecutionPath::Hybrid => match pick_lp(inputs, None) {
            Some(lp) => (RoutePath::Hybrid, Some(lp), None),
            None => (RoutePath::Reject, None, Some(RejectReason::NoRouteAvailable)),
        },
    }
}

/// The named venue if it is eligible, otherwise the best venue by
/// `latency_p95 x (1 - fill_rate)` (lower is better). Ties break on the
/// name so selection stays deterministic.
fn pick_lp(inputs: &RouteInputs<'_>, target: Option<&str>) -> Option<String> {
    if let Some(target) = target {
        if let Some(h) = inputs
            .lp_health
            .iter()
            .filter(|h| eligible(h, inputs.symbol))
            .find(|h| h.name == target)
        {
            return Some(h.name.clone());
        }
        // The named venue is down; fall through to the best one.
    }

    best_lp(inputs.lp_health, inputs.symbol)
}

fn eligible(h: &LpHealth, symbol: &str) -> bool {
    h.state.accepts_orders() && h.symbols.iter().any(|s| s == symbol)
}

/// Best eligible venue for a symbol by the router's quality score.
pub fn best_lp(lp_health: &[LpHealth], symbol: &str) -> Option<String> {
    lp_health
        .iter()
        .filter(|h| eligible(h, symbol))
        .min_by(|a, b| {
            let score_a = a.latency_p95_ms as f64 * (1.0 - a.fill_rate);
            let score_b = b.latency_p95_ms as f64 * (1.0 - b.fill_rate);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        })
        .map(|h| h.name.clone())
}

/// Deterministic percentage draw in [0, 100) from the order identity.
fn split_draw(account_id: &str, client_order_id: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(client_order_id.as_bytes());
    let digest = hasher.finalize();
    let word = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    (word % 100) as u8
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp::SessionState;
    use rust_decimal_macros::dec;

    fn health(name: &str, state: SessionState, latency: u64, fill_rate: f64) -> LpHealth {
        LpHealth {
            name: name.to_string(),
            state,
            latency_p95_ms: latency,
            fill_rate,
            symbols: vec!["EURUSD".to_string()],
        }
    }

    fn rule(name: &str, priority: u32, action: RuleAction) -> RoutingRule {
        RoutingRule {
            name: name.to_string(),
            priority,
            active: true,
            symbols: None,
            accounts: None,
            min_qty: None,
            max_qty: None,
            window: None,
            max_utilization_pct: None,
            min_utilization_pct: None,
            min_toxicity: None,
            max_toxicity: None,
            action,
            target_lp: None,
            hedge_pct: None,
        }
    }

    fn inputs<'a>(
        profile: &'a ClientProfile,
        rules: &'a [RoutingRule],
        lp_health: &'a [LpHealth],
    ) -> RouteInputs<'a> {
        RouteInputs {
            account_id: "A",
            client_order_id: "c1",
            symbol: "EURUSD",
            side: Side::Buy,
            qty: dec!(1),
            minute_of_day: 600,
            profile,
            rules,
            lp_health,
            impact: ExposureImpact::default(),
            default_path: ExecutionPath::BBook,
            toxicity_cutoff: 75,
        }
    }

    #[test]
    fn highest_priority_rule_wins() {
        let profile = ClientProfile::neutral("A");
        let rules = vec![
            rule("low", 1, RuleAction::BBook),
            rule("high", 10, RuleAction::Reject),
        ];
        let d = decide(&inputs(&profile, &rules, &[]));
        assert_eq!(d.path, RoutePath::Reject);
        assert_eq!(d.reject_reason, Some(RejectReason::RoutingRejected));
        assert_eq!(d.reason, "rule:high");
    }

    #[test]
    fn inactive_rules_are_skipped() {
        let profile = ClientProfile::neutral("A");
        let mut r = rule("off", 10, RuleAction::Reject);
        r.active = false;
        let rules = vec![r, rule("on", 1, RuleAction::BBook)];
        let d = decide(&inputs(&profile, &rules, &[]));
        assert_eq!(d.path, RoutePath::BBook);
        assert_eq!(d.reason, "rule:on");
    }

    #[test]
    fn size_filter_gates_match() {
        let profile = ClientProfile::neutral("A");
        let mut big_only = rule("big", 10, RuleAction::ABook);
        big_only.min_qty = Some(dec!(5));
        let rules = vec![big_only];
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];

        // qty 1 < 5: falls through to the all-b-book profile.
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.path, RoutePath::BBook);

        let mut i = inputs(&profile, &rules, &lps);
        i.qty = dec!(5);
        let d = decide(&i);
        assert_eq!(d.path, RoutePath::ABook);
        assert_eq!(d.lp_name.as_deref(), Some("LP-X"));
    }

    #[test]
    fn named_lp_preferred_best_lp_otherwise() {
        let profile = ClientProfile::neutral("A");
        let mut targeted = rule("send-to-y", 10, RuleAction::ABook);
        targeted.target_lp = Some("LP-Y".to_string());
        let rules = vec![targeted];

        // LP-Y healthy: honored.
        let lps = vec![
            health("LP-X", SessionState::Streaming, 5, 1.0),
            health("LP-Y", SessionState::Streaming, 50, 0.5),
        ];
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.lp_name.as_deref(), Some("LP-Y"));

        // LP-Y down: the best scoring venue takes over.
        let lps = vec![
            health("LP-X", SessionState::Streaming, 5, 1.0),
            health("LP-Y", SessionState::Disconnected, 50, 0.5),
        ];
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.lp_name.as_deref(), Some("LP-X"));
    }

    #[test]
    fn best_lp_minimizes_latency_times_miss_rate() {
        let profile = ClientProfile::neutral("A");
        let rules = vec![rule("out", 10, RuleAction::ABook)];
        // LP-A: 100 * 0.5 = 50. LP-B: 40 * 0.9 = 36. LP-B wins.
        let lps = vec![
            health("LP-A", SessionState::Streaming, 100, 0.5),
            health("LP-B", SessionState::Streaming, 40, 0.1),
        ];
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.lp_name.as_deref(), Some("LP-B"));
    }

    #[test]
    fn abook_without_venues_rejects_no_route() {
        let profile = ClientProfile::neutral("A");
        let rules = vec![rule("out", 10, RuleAction::ABook)];
        let d = decide(&inputs(&profile, &rules, &[]));
        assert_eq!(d.path, RoutePath::Reject);
        assert_eq!(d.reject_reason, Some(RejectReason::NoRouteAvailable));
    }

    #[test]
    fn hybrid_carries_hedge_pct_and_lp() {
        let profile = ClientProfile::neutral("A");
        let mut split = rule("split", 10, RuleAction::Hybrid);
        split.hedge_pct = Some(50);
        let rules = vec![split];
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.path, RoutePath::Hybrid);
        assert_eq!(d.hedge_pct, Some(50));
        assert_eq!(d.lp_name.as_deref(), Some("LP-X"));
    }

    #[test]
    fn alert_rules_fall_through_and_accumulate() {
        let profile = ClientProfile::neutral("A");
        let rules = vec![
            rule("watch-this", 20, RuleAction::Alert),
            rule("inner", 10, RuleAction::BBook),
        ];
        let d = decide(&inputs(&profile, &rules, &[]));
        assert_eq!(d.path, RoutePath::BBook);
        assert_eq!(d.alerts, vec!["watch-this".to_string()]);
        assert_eq!(d.reason, "rule:inner");
    }

    #[test]
    fn hold_queues_order() {
        let profile = ClientProfile::neutral("A");
        let rules = vec![rule("park", 10, RuleAction::Hold)];
        let d = decide(&inputs(&profile, &rules, &[]));
        assert_eq!(d.path, RoutePath::Hold);
    }

    #[test]
    fn manual_override_beats_split() {
        let mut profile = ClientProfile::neutral("A");
        profile.manual_override = Some(ExecutionPath::ABook);
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];
        let d = decide(&inputs(&profile, &[], &lps));
        assert_eq!(d.path, RoutePath::ABook);
        assert_eq!(d.reason, "profile:manualOverride");
    }

    #[test]
    fn toxic_profile_forces_abook() {
        let mut profile = ClientProfile::neutral("A");
        profile.toxicity_score = 80;
        // Percentages say b-book, toxicity wins.
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];
        let d = decide(&inputs(&profile, &[], &lps));
        assert_eq!(d.path, RoutePath::ABook);
        assert_eq!(d.reason, "profile:toxicity");
    }

    #[test]
    fn profile_split_is_deterministic() {
        let profile = ClientProfile {
            account_id: "A".to_string(),
            toxicity_score: 10,
            a_book_pct: 50,
            b_book_pct: 50,
            manual_override: None,
        };
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];
        let first = decide(&inputs(&profile, &[], &lps));
        for _ in 0..10 {
            let again = decide(&inputs(&profile, &[], &lps));
            assert_eq!(first.path, again.path);
            assert_eq!(first.lp_name, again.lp_name);
        }
    }

    #[test]
    fn split_draw_spreads_orders() {
        // Different order ids land on different draws.
        let draws: std::collections::HashSet<u8> = (0..50)
            .map(|i| split_draw("A", &format!("order-{i}")))
            .collect();
        assert!(draws.len() > 10, "draw should spread, got {}", draws.len());
        // And every draw is a percentage.
        assert!(draws.iter().all(|d| *d < 100));
    }

    #[test]
    fn full_bbook_profile_never_routes_out() {
        let profile = ClientProfile::neutral("A");
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];
        for i in 0..20 {
            let cid = format!("c{i}");
            let mut input = inputs(&profile, &[], &lps);
            input.client_order_id = &cid;
            let d = decide(&input);
            assert_eq!(d.path, RoutePath::BBook);
        }
    }

    #[test]
    fn utilization_predicate_gates_rule() {
        let profile = ClientProfile::neutral("A");
        let mut hedge_when_loaded = rule("hedge-out", 10, RuleAction::ABook);
        hedge_when_loaded.min_utilization_pct = Some(80.0);
        let rules = vec![hedge_when_loaded];
        let lps = vec![health("LP-X", SessionState::Streaming, 10, 0.9)];

        // Low utilization: rule does not match.
        let d = decide(&inputs(&profile, &rules, &lps));
        assert_eq!(d.path, RoutePath::BBook);

        // High utilization: rule takes over.
        let mut i = inputs(&profile, &rules, &lps);
        i.impact = ExposureImpact {
            utilization_before_pct: 70.0,
            utilization_after_pct: 90.0,
        };
        let d = decide(&i);
        assert_eq!(d.path, RoutePath::ABook);
    }

    #[test]
    fn decisions_carry_exposure_impact() {
        let profile = ClientProfile::neutral("A");
        let mut i = inputs(&profile, &[], &[]);
        i.impact = ExposureImpact {
            utilization_before_pct: 10.0,
            utilization_after_pct: 25.0,
        };
        let d = decide(&i);
        assert!((d.exposure_before_pct - 10.0).abs() < f64::EPSILON);
        assert!((d.exposure_after_pct - 25.0).abs() < f64::EPSILON);
    }
}
