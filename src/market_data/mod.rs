// =============================================================================
// Market Data — tick ingestion and best bid/ask distribution
// =============================================================================

mod board;

pub use board::{PublishOutcome, QuoteBoard};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A raw quote from one liquidity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub lp: String,
    /// Strictly increasing per (symbol, lp); stale sequences are rejected.
    pub seq: u64,
    pub ts: u64,
}

/// The aggregated best bid/ask across fresh LP quotes for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub ts: u64,
}

impl BestQuote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}
