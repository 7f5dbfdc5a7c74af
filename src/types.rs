// =============================================================================
// Shared types used across the Meridian broker engine
// =============================================================================
//
// Rejections are values, never exceptions: every reason a request can fail is
// a variant of `RejectReason`, serialized in camelCase so API clients can
// switch on it. Free-text detail rides along in `Rejection::detail`.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// The position side a fill in this direction builds.
    pub fn position_side(self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for longs, -1 for shorts.
    pub fn sign(self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Order type. Stop and stop-limit orders rest until their trigger price
/// trades, then convert to market / limit respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::Stop => write!(f, "stop"),
            Self::StopLimit => write!(f, "stopLimit"),
            Self::TrailingStop => write!(f, "trailingStop"),
        }
    }
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tif {
    Gtc,
    Ioc,
    Fok,
    Day,
    Gtd,
}

impl Default for Tif {
    fn default() -> Self {
        Self::Gtc
    }
}

impl std::fmt::Display for Tif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
            Self::Day => write!(f, "DAY"),
            Self::Gtd => write!(f, "GTD"),
        }
    }
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderState {
    Pending,
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::New => write!(f, "new"),
            Self::PartiallyFilled => write!(f, "partiallyFilled"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Whether the engine nets opposite fills into one position per
/// (account, symbol) or keeps long and short books side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Hedging,
    Netting,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Hedging
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hedging => write!(f, "hedging"),
            Self::Netting => write!(f, "netting"),
        }
    }
}

/// Where an order's risk ends up: external venue, our own book, or a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionPath {
    ABook,
    BBook,
    Hybrid,
}

impl Default for ExecutionPath {
    fn default() -> Self {
        Self::BBook
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ABook => write!(f, "aBook"),
            Self::BBook => write!(f, "bBook"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Maker/taker flag on a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiquidityRole {
    Maker,
    Taker,
}

/// Account trading status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    Active,
    Locked,
    Closed,
}

impl Default for AccountState {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Locked => write!(f, "locked"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

// =============================================================================
// Rejection taxonomy
// =============================================================================

/// Every machine-readable reason a request can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    // --- Input ---------------------------------------------------------------
    DuplicateClientOrderId,
    InvalidOrder,
    UnknownSymbol,
    UnknownOrder,
    UnknownPosition,

    // --- Risk ----------------------------------------------------------------
    AccountInactive,
    SymbolUntradable,
    BreakerTripped,
    MarginInsufficient,
    LeverageExceeded,
    PositionLimitExceeded,
    DailyLossLimitExceeded,

    // --- Routing -------------------------------------------------------------
    RoutingRejected,
    ExposureBreach,
    NoRouteAvailable,

    // --- Liveness / transport ------------------------------------------------
    NoMarket,
    LpUnavailable,
    Timeout,
    BackpressureShed,

    // --- Internal ------------------------------------------------------------
    JournalError,
    InconsistentState,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The wire form doubles as the display form.
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// A rejection plus optional structured detail (e.g. required vs available
/// margin) that the API surfaces verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Rejection {
    pub fn new(reason: RejectReason) -> Self {
        Self {
            reason,
            detail: None,
        }
    }

    pub fn with_detail(reason: RejectReason, detail: serde_json::Value) -> Self {
        Self {
            reason,
            detail: Some(detail),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{} ({})", self.reason, d),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl From<RejectReason> for Rejection {
    fn from(reason: RejectReason) -> Self {
        Self::new(reason)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_flip_and_sign() {
        assert_eq!(Side::Buy.flip(), Side::Sell);
        assert_eq!(Side::Sell.flip(), Side::Buy);
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), -Decimal::ONE);
        assert_eq!(Side::Buy.position_side(), PositionSide::Long);
        assert_eq!(Side::Sell.position_side(), PositionSide::Short);
    }

    #[test]
    fn terminal_order_states() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(OrderState::Expired.is_terminal());
        assert!(!OrderState::Pending.is_terminal());
        assert!(!OrderState::New.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }

    #[test]
    fn reject_reason_wire_form_is_camel_case() {
        let json = serde_json::to_string(&RejectReason::DuplicateClientOrderId).unwrap();
        assert_eq!(json, "\"duplicateClientOrderId\"");
        let json = serde_json::to_string(&RejectReason::MarginInsufficient).unwrap();
        assert_eq!(json, "\"marginInsufficient\"");
        let json = serde_json::to_string(&RejectReason::BreakerTripped).unwrap();
        assert_eq!(json, "\"breakerTripped\"");
    }

    #[test]
    fn reject_reason_display_matches_wire_form() {
        assert_eq!(
            RejectReason::ExposureBreach.to_string(),
            "exposureBreach".to_string()
        );
        assert_eq!(RejectReason::NoMarket.to_string(), "noMarket".to_string());
    }

    #[test]
    fn rejection_round_trips_with_detail() {
        let r = Rejection::with_detail(
            RejectReason::MarginInsufficient,
            serde_json::json!({"required": "120.5", "available": "100"}),
        );
        let json = serde_json::to_string(&r).unwrap();
        let back: Rejection = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reason, RejectReason::MarginInsufficient);
        assert!(back.detail.is_some());
    }

    #[test]
    fn enum_serde_forms() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&Tif::Gtc).unwrap(), "\"GTC\"");
        assert_eq!(
            serde_json::to_string(&OrderKind::StopLimit).unwrap(),
            "\"stopLimit\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionPath::ABook).unwrap(),
            "\"aBook\""
        );
        assert_eq!(
            serde_json::to_string(&MarginMode::Hedging).unwrap(),
            "\"hedging\""
        );
    }
}
