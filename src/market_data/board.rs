// =============================================================================
// Quote Board — per-symbol quote aggregation across liquidity providers
// =============================================================================
//
// The board keeps one last-quote slot per (symbol, lp) and derives the
// authoritative best bid (max over fresh LP bids) and best ask (min over
// fresh LP asks). A quote older than the stale TTL drops out of the
// computation until its LP sends a fresher one; when every LP is stale the
// symbol has no market and the snapshot reports nothing.
//
// Subscribers get a lossy broadcast stream: slow consumers skip intermediate
// quotes, publication never blocks. A bounded per-symbol history ring feeds
// mark-to-market.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{BestQuote, Quote};
use crate::clock::{Clock, SharedClock};

/// Per-symbol history depth for mark-to-market.
const HISTORY_CAPACITY: usize = 4_096;

/// Broadcast buffer per symbol; laggards drop, publishers never wait.
const SUBSCRIBER_BUFFER: usize = 256;

/// Result of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted; the best quote was recomputed.
    Accepted,
    /// Rejected: sequence not newer than the last seen for (symbol, lp).
    StaleSequence,
    /// Rejected: crossed or non-positive quote.
    Invalid,
}

struct SymbolBook {
    /// Last quote per LP.
    slots: HashMap<String, Quote>,
    /// Bounded best-quote history, newest last.
    history: VecDeque<BestQuote>,
    /// Fan-out to subscribers; created lazily on first subscribe or publish.
    sender: broadcast::Sender<BestQuote>,
    /// Last computed best, kept even after it goes stale (held marks).
    last_best: Option<BestQuote>,
}

impl SymbolBook {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            slots: HashMap::new(),
            history: VecDeque::new(),
            sender,
            last_best: None,
        }
    }
}

/// The live quote board shared by the matcher, the router, and subscribers.
pub struct QuoteBoard {
    books: RwLock<HashMap<String, SymbolBook>>,
    stale_ttl_ms: u64,
    clock: SharedClock,
}

impl QuoteBoard {
    pub fn new(clock: SharedClock, stale_ttl_ms: u64) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            stale_ttl_ms,
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Ingest one LP quote. Stale sequences and crossed quotes are rejected.
    pub fn publish(&self, quote: Quote) -> PublishOutcome {
        if quote.ask < quote.bid || quote.bid <= rust_decimal::Decimal::ZERO {
            warn!(symbol = %quote.symbol, lp = %quote.lp, bid = %quote.bid, ask = %quote.ask, "invalid quote dropped");
            return PublishOutcome::Invalid;
        }

        let now = self.clock.now_ms();
        let mut books = self.books.write();
        let book = books
            .entry(quote.symbol.clone())
            .or_insert_with(SymbolBook::new);

        if let Some(last) = book.slots.get(&quote.lp) {
            if quote.seq <= last.seq {
                debug!(
                    symbol = %quote.symbol,
                    lp = %quote.lp,
                    seq = quote.seq,
                    last_seq = last.seq,
                    "stale quote sequence rejected"
                );
                return PublishOutcome::StaleSequence;
            }
        }

        book.slots.insert(quote.lp.clone(), quote.clone());

        if let Some(best) = compute_best(&quote.symbol, &book.slots, now, self.stale_ttl_ms) {
            book.history.push_back(best.clone());
            while book.history.len() > HISTORY_CAPACITY {
                book.history.pop_front();
            }
            book.last_best = Some(best.clone());
            // Lossy fan-out: send fails only when no receiver exists.
            let _ = book.sender.send(best);
        }

        PublishOutcome::Accepted
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// The current best bid/ask, or `None` when every LP quote is stale
    /// (no market). Non-blocking; freshness is evaluated at read time.
    pub fn snapshot(&self, symbol: &str) -> Option<BestQuote> {
        let now = self.clock.now_ms();
        let books = self.books.read();
        let book = books.get(symbol)?;
        compute_best(symbol, &book.slots, now, self.stale_ttl_ms)
    }

    /// The most recent best quote regardless of freshness, for held marks.
    pub fn last_known(&self, symbol: &str) -> Option<BestQuote> {
        self.books.read().get(symbol)?.last_best.clone()
    }

    /// Whether at least one LP currently has a fresh quote.
    pub fn has_market(&self, symbol: &str) -> bool {
        self.snapshot(symbol).is_some()
    }

    /// Subscribe to the symbol's best-quote stream. The stream is lossy:
    /// a lagging receiver skips quotes rather than slowing publication.
    pub fn subscribe(&self, symbol: &str) -> broadcast::Receiver<BestQuote> {
        let mut books = self.books.write();
        books
            .entry(symbol.to_string())
            .or_insert_with(SymbolBook::new)
            .sender
            .subscribe()
    }

    /// Recent best-quote history, oldest first, bounded by the ring size.
    pub fn history(&self, symbol: &str, max: usize) -> Vec<BestQuote> {
        let books = self.books.read();
        match books.get(symbol) {
            Some(book) => {
                let skip = book.history.len().saturating_sub(max);
                book.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Symbols with at least one slot, fresh or not.
    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for QuoteBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteBoard")
            .field("symbols", &self.books.read().len())
            .field("stale_ttl_ms", &self.stale_ttl_ms)
            .finish()
    }
}

/// Best bid = max over fresh LP bids, best ask = min over fresh LP asks.
/// Sizes come from the LP providing each side. O(#LPs) per call.
fn compute_best(
    symbol: &str,
    slots: &HashMap<String, Quote>,
    now_ms: u64,
    stale_ttl_ms: u64,
) -> Option<BestQuote> {
    let cutoff = now_ms.saturating_sub(stale_ttl_ms);
    let mut best_bid: Option<&Quote> = None;
    let mut best_ask: Option<&Quote> = None;

    for quote in slots.values() {
        if quote.ts < cutoff {
            continue;
        }
        if best_bid.map_or(true, |b| quote.bid > b.bid) {
            best_bid = Some(quote);
        }
        if best_ask.map_or(true, |a| quote.ask < a.ask) {
            best_ask = Some(quote);
        }
    }

    let (bid_q, ask_q) = (best_bid?, best_ask?);
    Some(BestQuote {
        symbol: symbol.to_string(),
        bid: bid_q.bid,
        ask: ask_q.ask,
        bid_size: bid_q.bid_size,
        ask_size: ask_q.ask_size,
        ts: bid_q.ts.max(ask_q.ts),
    })
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

    fn quote(symbol: &str, lp: &str, bid: &str, ask: &str, seq: u64, ts: u64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            bid: bid.parse().unwrap(),
            ask: ask.parse().unwrap(),
            bid_size: dec!(1000000),
            ask_size: dec!(1000000),
            lp: lp.to_string(),
            seq,
            ts,
        }
    }

    fn board_at(now: u64) -> (QuoteBoard, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let board = QuoteBoard::new(clock.clone(), 2_000);
        (board, clock)
    }

    #[test]
    fn best_quote_across_lps() {
        let (board, _) = board_at(10_000);
        board.publish(quote("EURUSD", "LP-X", "1.10000", "1.10020", 1, 10_000));
        board.publish(quote("EURUSD", "LP-Y", "1.10005", "1.10025", 1, 10_000));

        let best = board.snapshot("EURUSD").unwrap();
        // Highest bid from LP-Y, lowest ask from LP-X.
        assert_eq!(best.bid, dec!(1.10005));
        assert_eq!(best.ask, dec!(1.10020));
    }

    #[test]
    fn stale_sequence_rejected() {
        let (board, _) = board_at(10_000);
        assert_eq!(
            board.publish(quote("EURUSD", "LP-X", "1.1", "1.2", 5, 10_000)),
            PublishOutcome::Accepted
        );
        assert_eq!(
            board.publish(quote("EURUSD", "LP-X", "1.1", "1.2", 5, 10_001)),
            PublishOutcome::StaleSequence
        );
        assert_eq!(
            board.publish(quote("EURUSD", "LP-X", "1.1", "1.2", 4, 10_002)),
            PublishOutcome::StaleSequence
        );
        // A different LP has its own sequence space.
        assert_eq!(
            board.publish(quote("EURUSD", "LP-Y", "1.1", "1.2", 1, 10_003)),
            PublishOutcome::Accepted
        );
    }

    #[test]
    fn crossed_quote_rejected() {
        let (board, _) = board_at(10_000);
        assert_eq!(
            board.publish(quote("EURUSD", "LP-X", "1.2", "1.1", 1, 10_000)),
            PublishOutcome::Invalid
        );
        assert!(board.snapshot("EURUSD").is_none());
    }

    #[test]
    fn stale_lp_excluded_from_best() {
        let (board, clock) = board_at(10_000);
        board.publish(quote("EURUSD", "LP-X", "1.10010", "1.10030", 1, 10_000));
        board.publish(quote("EURUSD", "LP-Y", "1.10000", "1.10020", 1, 10_000));

        // Advance past the TTL, refresh only LP-Y.
        clock.set(13_000);
        board.publish(quote("EURUSD", "LP-Y", "1.10001", "1.10021", 2, 13_000));

        let best = board.snapshot("EURUSD").unwrap();
        // LP-X's better bid is stale and must be ignored.
        assert_eq!(best.bid, dec!(1.10001));
        assert_eq!(best.ask, dec!(1.10021));
    }

    #[test]
    fn all_stale_means_no_market() {
        let (board, clock) = board_at(10_000);
        board.publish(quote("EURUSD", "LP-X", "1.1", "1.2", 1, 10_000));
        assert!(board.has_market("EURUSD"));

        clock.set(20_000);
        assert!(board.snapshot("EURUSD").is_none());
        assert!(!board.has_market("EURUSD"));
        // The last known value is still held for flagged marks.
        assert!(board.last_known("EURUSD").is_some());
    }

    #[test]
    fn unknown_symbol_has_no_market() {
        let (board, _) = board_at(10_000);
        assert!(board.snapshot("XAUUSD").is_none());
        assert!(board.history("XAUUSD", 10).is_empty());
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let (board, _) = board_at(10_000);
        for i in 0..10 {
            board.publish(quote("EURUSD", "LP-X", "1.10000", "1.10020", i + 1, 10_000));
        }
        let hist = board.history("EURUSD", 5);
        assert_eq!(hist.len(), 5);
        let all = board.history("EURUSD", 100);
        assert_eq!(all.len(), 10);
    }

    #[tokio::test]
    async fn subscribers_receive_quotes() {
        let (board, _) = board_at(10_000);
        let mut rx = board.subscribe("EURUSD");
        board.publish(quote("EURUSD", "LP-X", "1.10000", "1.10020", 1, 10_000));

        let best = rx.recv().await.unwrap();
        assert_eq!(best.bid, dec!(1.10000));
        assert_eq!(best.ask, dec!(1.10020));
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_not_blocks() {
        let (board, _) = board_at(10_000);
        let mut rx = board.subscribe("EURUSD");

        // Overflow the subscriber buffer without draining it.
        for i in 0..(SUBSCRIBER_BUFFER as u64 + 50) {
            board.publish(quote("EURUSD", "LP-X", "1.10000", "1.10020", i + 1, 10_000));
        }

        // The receiver lags: the oldest messages are gone, the stream lives.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            Ok(_) => panic!("expected lag after overflow"),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
