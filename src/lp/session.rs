// =============================================================================
// LP Session — lifecycle of the conversation with one venue
// =============================================================================
//
// State machine:
//
//   disconnected -> connecting -> connected -> (streaming | degraded)
//                                                   |            |
//                                                   +---- disconnected
//
// Heartbeats drive degradation: one miss short of the configured limit the
// session degrades, at the limit it disconnects and every in-flight order to
// that venue is surfaced as unknown. Reconnects back off exponentially with
// jitter (base 500 ms, cap 60 s).
//
// Writes to a session are single-threaded by construction: the dispatcher
// awaits `submit` on one session at a time, and sessions never share state.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::adapter::{AdapterResponse, LpAdapter};
use super::{LpAck, LpEvent, SubmitRequest};
use crate::clock::{Clock, SharedClock};
use crate::types::{RejectReason, Rejection};

/// Reconnect backoff base in milliseconds.
const BACKOFF_BASE_MS: u64 = 500;

/// Reconnect backoff cap in milliseconds.
const BACKOFF_CAP_MS: u64 = 60_000;

/// Latency samples retained for the p95 estimate.
const LATENCY_SAMPLES: usize = 256;

/// Connection state of one LP session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Degraded,
}

impl SessionState {
    /// Whether the session accepts order flow.
    pub fn accepts_orders(self) -> bool {
        matches!(self, Self::Connected | Self::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Streaming => write!(f, "streaming"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health snapshot consumed by the router's venue selection.
#[derive(Debug, Clone, Serialize)]
pub struct LpHealth {
    pub name: String,
    pub state: SessionState,
    pub latency_p95_ms: u64,
    /// Filled submits / total submits, 1.0 when nothing was submitted yet.
    pub fill_rate: f64,
    pub symbols: Vec<String>,
}

/// One liquidity-provider session.
pub struct LpSession {
    name: String,
    symbols: Vec<String>,
    adapter: LpAdapter,
    state: RwLock<SessionState>,
    missed_heartbeats: AtomicU32,
    /// Misses at which the session is torn down; it degrades one earlier.
    heartbeat_miss_limit: u32,
    submit_cache: RwLock<HashMap<String, LpAck>>,
    in_flight: RwLock<HashMap<String, String>>,
    latency_samples: RwLock<VecDeque<u64>>,
    submits: AtomicU64,
    fills: AtomicU64,
    events_tx: mpsc::Sender<LpEvent>,
    clock: SharedClock,
}

impl LpSession {
    pub fn new(
        name: &str,
        symbols: Vec<String>,
        adapter: LpAdapter,
        heartbeat_miss_limit: u32,
        events_tx: mpsc::Sender<LpEvent>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.to_string(),
            symbols,
            adapter,
            state: RwLock::new(SessionState::Disconnected),
            missed_heartbeats: AtomicU32::new(0),
            heartbeat_miss_limit: heartbeat_miss_limit.max(2),
            submit_cache: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            latency_samples: RwLock::new(VecDeque::new()),
            submits: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            events_tx,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn supports(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s == symbol)
    }

    fn transition(&self, to: SessionState) {
        let mut state = self.state.write();
        if *state == to {
            return;
        }
        info!(lp = %self.name, from = %*state, to = %to, "session state changed");
        *state = to;
        drop(state);
        let _ = self.events_tx.try_send(LpEvent::StatusChange {
            lp: self.name.clone(),
            state: to,
        });
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    pub fn begin_connect(&self) {
        self.transition(SessionState::Connecting);
    }

    /// Connection established; heartbeat counter resets.
    pub fn mark_connected(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
        self.transition(SessionState::Connected);
    }

    /// First market data received on the session.
    pub fn mark_streaming(&self) {
        if self.state().accepts_orders() {
            self.transition(SessionState::Streaming);
        }
    }

    pub fn mark_disconnected(&self) {
        self.transition(SessionState::Disconnected);
        self.abandon_in_flight();
    }

    /// A heartbeat arrived in time; a degraded session recovers.
    pub fn record_heartbeat_ok(&self) {
        self.missed_heartbeats.store(0, Ordering::SeqCst);
        if self.state() == SessionState::Degraded {
            self.transition(SessionState::Streaming);
        }
    }

    /// A heartbeat deadline passed. Returns the state after the miss.
    pub fn record_heartbeat_miss(&self) -> SessionState {
        let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(lp = %self.name, missed, limit = self.heartbeat_miss_limit, "heartbeat missed");

        if missed >= self.heartbeat_miss_limit {
            self.mark_disconnected();
        } else if missed >= self.heartbeat_miss_limit - 1 {
            self.transition(SessionState::Degraded);
        }
        self.state()
    }

    /// Orders in flight when the session died have unknown fate until a
    /// reconnect reconciles them.
    fn abandon_in_flight(&self) {
        let abandoned: Vec<String> = self.in_flight.write().drain().map(|(cid, _)| cid).collect();
        for client_order_id in abandoned {
            warn!(lp = %self.name, client_order_id = %client_order_id, "in-flight order fate unknown");
            let _ = self.events_tx.try_send(LpEvent::OrderUnknown {
                lp: self.name.clone(),
                client_order_id,
            });
        }
    }

    /// After a reconnect, compare our in-flight set against the venue's open
    /// orders; anything the venue no longer knows is surfaced as unknown.
    pub async fn reconcile_open_orders(&self) {
        let venue_open = self.adapter.open_orders().await;
        let mut lost = Vec::new();
        {
            let mut in_flight = self.in_flight.write();
            in_flight.retain(|client_order_id, lp_order_id| {
                if venue_open.contains(lp_order_id) {
                    true
                } else {
                    lost.push(client_order_id.clone());
                    false
                }
            });
        }
        for client_order_id in lost {
            let _ = self.events_tx.try_send(LpEvent::OrderUnknown {
                lp: self.name.clone(),
                client_order_id,
            });
        }
        debug!(lp = %self.name, "open-order reconciliation complete");
    }

    // -------------------------------------------------------------------------
    // Order flow
    // -------------------------------------------------------------------------

    /// Send an order to the venue. Idempotent on `client_order_id`: a
    /// duplicate submission returns the prior ack without re-sending.
    pub async fn submit(&self, req: SubmitRequest) -> Result<LpAck, Rejection> {
        if let Some(prior) = self.submit_cache.read().get(&req.client_order_id) {
            debug!(lp = %self.name, client_order_id = %req.client_order_id, "duplicate submit, returning prior ack");
            return Ok(prior.clone());
        }

        if !self.state().accepts_orders() {
            return Err(Rejection::with_detail(
                RejectReason::LpUnavailable,
                serde_json::json!({ "lp": self.name, "state": self.state().to_string() }),
            ));
        }

        let started = self.clock.now_ms();
        self.submits.fetch_add(1, Ordering::SeqCst);
        let response = self.adapter.submit(&self.name, &req).await;
        self.record_latency(self.clock.now_ms().saturating_sub(started));

        match response {
            AdapterResponse::Ack { lp_order_id, fill } => {
                let ack = LpAck {
                    lp: self.name.clone(),
                    lp_order_id: lp_order_id.clone(),
                    client_order_id: req.client_order_id.clone(),
                };
                self.submit_cache
                    .write()
                    .insert(req.client_order_id.clone(), ack.clone());
                self.in_flight
                    .write()
                    .insert(req.client_order_id.clone(), lp_order_id);

                if let Some(fill) = fill {
                    self.fills.fetch_add(1, Ordering::SeqCst);
                    self.in_flight.write().remove(&fill.client_order_id);
                    let _ = self.events_tx.try_send(LpEvent::Fill(fill));
                }
                Ok(ack)
            }
            AdapterResponse::Reject { reason } => {
                let _ = self.events_tx.try_send(LpEvent::Reject {
                    lp: self.name.clone(),
                    client_order_id: req.client_order_id.clone(),
                    reason: reason.clone(),
                });
                Err(Rejection::with_detail(
                    RejectReason::LpUnavailable,
                    serde_json::json!({ "lp": self.name, "venueReason": reason }),
                ))
            }
        }
    }

    /// The prior ack for a client order id, if this session saw it.
    pub fn ack_for(&self, client_order_id: &str) -> Option<LpAck> {
        self.submit_cache.read().get(client_order_id).cloned()
    }

    /// Cancel a venue order by its venue-side id.
    pub async fn cancel(&self, lp_order_id: &str) -> Result<(), Rejection> {
        if !self.state().accepts_orders() {
            return Err(RejectReason::LpUnavailable.into());
        }
        match self.adapter.cancel(&self.name, lp_order_id).await {
            AdapterResponse::Ack { .. } => {
                self.in_flight.write().retain(|_, id| id != lp_order_id);
                Ok(())
            }
            AdapterResponse::Reject { reason } => Err(Rejection::with_detail(
                RejectReason::LpUnavailable,
                serde_json::json!({ "lp": self.name, "venueReason": reason }),
            )),
        }
    }

    // -------------------------------------------------------------------------
    // Health
    // -------------------------------------------------------------------------

    fn record_latency(&self, sample_ms: u64) {
        let mut samples = self.latency_samples.write();
        samples.push_back(sample_ms);
        while samples.len() > LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn health(&self) -> LpHealth {
        let latency_p95_ms = {
            let samples = self.latency_samples.read();
            if samples.is_empty() {
                0
            } else {
                let mut sorted: Vec<u64> = samples.iter().copied().collect();
                sorted.sort_unstable();
                let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
                sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
            }
        };

        let submits = self.submits.load(Ordering::SeqCst);
        let fills = self.fills.load(Ordering::SeqCst);
        let fill_rate = if submits == 0 {
            1.0
        } else {
            fills as f64 / submits as f64
        };

        LpHealth {
            name: self.name.clone(),
            state: self.state(),
            latency_p95_ms,
            fill_rate,
            symbols: self.symbols.clone(),
        }
    }
}

impl std::fmt::Debug for LpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LpSession")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight.read().len())
            .finish()
    }
}

/// Jittered exponential backoff for reconnect attempt `attempt` (0-based).
pub fn next_backoff_ms(attempt: u32) -> u64 {
    let raw = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.min(20))
        .min(BACKOFF_CAP_MS);
    // Jitter into [raw/2, raw] so reconnect storms spread out.
    rand::thread_rng().gen_range(raw / 2..=raw)
}

// =============================================================================
// Tests
// =============================================================================
