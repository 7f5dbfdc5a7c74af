// =============================================================================
// Liquidity Providers — sessions, adapters, and the event fan-in
// =============================================================================

mod adapter;
mod manager;
mod session;

pub use adapter::{AdapterResponse, LpAdapter, SignedRestLp, SimulatedLp};
pub use manager::SessionManager;
pub use session::{next_backoff_ms, LpHealth, LpSession, SessionState};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market_data::Quote;
use crate::types::Side;

/// An order handed to a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Caller-provided id; duplicate submissions return the prior ack.
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    /// Reference price: the limit price, or the best opposite-side quote for
    /// market orders.
    pub price_hint: Decimal,
}

/// Acknowledgement from a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpAck {
    pub lp: String,
    pub lp_order_id: String,
    pub client_order_id: String,
}

/// An execution reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpFill {
    pub lp: String,
    pub lp_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub ts: u64,
}

/// Everything a session can surface to the engine. Per-session ordering is
/// preserved; sessions interleave freely with each other.
#[derive(Debug, Clone)]
pub enum LpEvent {
    Quote(Quote),
    Fill(LpFill),
    Reject {
        lp: String,
        client_order_id: String,
        reason: String,
    },
    StatusChange {
        lp: String,
        state: SessionState,
    },
    /// In-flight order whose fate is unknown after a session loss.
    OrderUnknown {
        lp: String,
        client_order_id: String,
    },
}
