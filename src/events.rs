// =============================================================================
// Event Hub — sequenced fan-out of authoritative engine events
// =============================================================================
//
// Order, position, and exposure updates flow through here to WebSocket
// subscribers. Every event gets a global sequence number and lands in a
// bounded replay ring so a client can resume from the last sequence it saw.
// Quotes do not pass through the hub; they fan out lossily from the quote
// board.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::oms::{Order, Position};

/// Replay ring capacity.
const REPLAY_CAPACITY: usize = 8_192;

/// Broadcast buffer for live subscribers.
const LIVE_BUFFER: usize = 1_024;

/// One sequenced engine event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    #[serde(rename_all = "camelCase")]
    OrderUpdate {
        seq: u64,
        account_id: String,
        order: Order,
    },
    #[serde(rename_all = "camelCase")]
    PositionUpdate {
        seq: u64,
        account_id: String,
        position: Position,
    },
    #[serde(rename_all = "camelCase")]
    ExposureUpdate {
        seq: u64,
        symbol: String,
        scope: String,
        net: Decimal,
        gross: Decimal,
    },
}

impl EngineEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::OrderUpdate { seq, .. }
            | Self::PositionUpdate { seq, .. }
            | Self::ExposureUpdate { seq, .. } => *seq,
        }
    }

    /// The account an event belongs to, for per-account stream filtering.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::OrderUpdate { account_id, .. } | Self::PositionUpdate { account_id, .. } => {
                Some(account_id)
            }
            Self::ExposureUpdate { .. } => None,
        }
    }
}

/// Sequenced publish/subscribe hub with bounded replay.
pub struct EventHub {
    next_seq: AtomicU64,
    sender: broadcast::Sender<EngineEvent>,
    replay: RwLock<VecDeque<EngineEvent>>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            next_seq: AtomicU64::new(1),
            sender,
            replay: RwLock::new(VecDeque::new()),
        }
    }

    fn publish(&self, event: EngineEvent) {
        let mut replay = self.replay.write();
        replay.push_back(event.clone());
        while replay.len() > REPLAY_CAPACITY {
            replay.pop_front();
        }
        drop(replay);
        // No receivers is fine; send only fails then.
        let _ = self.sender.send(event);
    }

    pub fn publish_order(&self, order: Order) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.publish(EngineEvent::OrderUpdate {
            seq,
            account_id: order.account_id.clone(),
            order,
        });
    }

    pub fn publish_position(&self, position: Position) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.publish(EngineEvent::PositionUpdate {
            seq,
            account_id: position.account_id.clone(),
            position,
        });
    }

    pub fn publish_exposure(&self, symbol: &str, scope: &str, net: Decimal, gross: Decimal) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.publish(EngineEvent::ExposureUpdate {
            seq,
            symbol: symbol.to_string(),
            scope: scope.to_string(),
            net,
            gross,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Buffered events after `seq`, oldest first, for stream resumption.
    pub fn replay_after(&self, seq: u64) -> Vec<EngineEvent> {
        self.replay
            .read()
            .iter()
            .filter(|e| e.seq() > seq)
            .cloned()
            .collect()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("replay", &self.replay.read().len())
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
    fn sequences_are_monotonic() {
        let hub = EventHub::new();
        hub.publish_exposure("EURUSD", "global", dec!(100000), dec!(100000));
        hub.publish_exposure("EURUSD", "global", dec!(200000), dec!(200000));
        let events = hub.replay_after(0);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq(), 1);
        assert_eq!(events[1].seq(), 2);
    }

    #[test]
    fn replay_after_filters() {
        let hub = EventHub::new();
        for _ in 0..5 {
            hub.publish_exposure("EURUSD", "global", dec!(1), dec!(1));
        }
        let tail = hub.replay_after(3);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq(), 4);
    }

    #[tokio::test]
    async fn live_subscription_receives() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.publish_exposure("EURUSD", "global", dec!(5), dec!(5));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.seq(), 1);
        assert!(event.account_id().is_none());
    }
}
