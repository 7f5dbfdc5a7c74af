// =============================================================================
// Session Manager — owns every LP session and the shared event fan-in
// =============================================================================
//
// Sessions run independently and in parallel; everything they surface
// (quotes, fills, rejects, state changes) funnels into one bounded channel
// that the engine's event loop drains in arrival order.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::info;

use super::session::{LpHealth, LpSession};
use super::{LpAck, LpEvent, SubmitRequest};
use crate::types::{RejectReason, Rejection};

/// Depth of the shared LP event channel. Producers drop status noise when
/// the engine lags; fills ride the same channel and size it.
const EVENT_CHANNEL_DEPTH: usize = 4_096;

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<LpSession>>>,
    events_tx: mpsc::Sender<LpEvent>,
    /// Taken exactly once by the engine event loop.
    events_rx: Mutex<Option<mpsc::Receiver<LpEvent>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Sender handed to each session at construction.
    pub fn events_sender(&self) -> mpsc::Sender<LpEvent> {
        self.events_tx.clone()
    }

    /// The receiving half of the event fan-in. Panics if taken twice; the
    /// engine has exactly one event loop.
    pub fn take_events(&self) -> mpsc::Receiver<LpEvent> {
        self.events_rx
            .lock()
            .take()
            .expect("LP event receiver already taken")
    }

    pub fn add_session(&self, session: Arc<LpSession>) {
        info!(lp = %session.name(), "session registered");
        self.sessions
            .write()
            .insert(session.name().to_string(), session);
    }

    pub fn session(&self, name: &str) -> Option<Arc<LpSession>> {
        self.sessions.read().get(name).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<LpSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Route a submit to the named venue.
    pub async fn submit(&self, lp: &str, req: SubmitRequest) -> Result<LpAck, Rejection> {
        let session = self.session(lp).ok_or_else(|| {
            Rejection::with_detail(
                RejectReason::LpUnavailable,
                serde_json::json!({ "lp": lp, "error": "unknown session" }),
            )
        })?;
        session.submit(req).await
    }

    /// Cancel a venue-side order.
    pub async fn cancel(&self, lp: &str, lp_order_id: &str) -> Result<(), Rejection> {
        let session = self
            .session(lp)
            .ok_or_else(|| Rejection::new(RejectReason::LpUnavailable))?;
        session.cancel(lp_order_id).await
    }

    /// Health of every session, for the router and the dashboard.
    pub fn health_snapshot(&self) -> Vec<LpHealth> {
        let mut health: Vec<LpHealth> = self
            .sessions
            .read()
            .values()
            .map(|s| s.health())
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
