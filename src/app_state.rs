// =============================================================================
// Engine State — ties every component together
// =============================================================================
//
// The single composition root for the engine. All subsystems manage their
// own interior mutability; EngineState holds the Arcs, a monotonically
// increasing version for the dashboard feed, the error ring, and the
// snapshot/recovery plumbing over the journal.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::accounts::{Account, AccountBook};
use crate::breakers::{Breaker, BreakerPanel};
use crate::clock::{Clock, SharedClock};
use crate::config::EngineConfig;
use crate::events::EventHub;
use crate::exposure::{Counters, ExposureEngine, ExposureKey};
use crate::instruments::InstrumentRegistry;
use crate::journal::Journal;
use crate::lp::{LpHealth, SessionManager};
use crate::market_data::QuoteBoard;
use crate::oms::{OrderStore, Position, PositionBook};
use crate::profile::ClientProfileStore;

/// Maximum number of recent errors retained for the dashboard.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central shared state, wrapped in `Arc` at startup.
pub struct EngineState {
    pub state_version: AtomicU64,

    pub config: RwLock<EngineConfig>,
    pub clock: SharedClock,

    pub registry: Arc<InstrumentRegistry>,
    pub accounts: Arc<AccountBook>,
    pub profiles: Arc<ClientProfileStore>,
    pub quotes: Arc<QuoteBoard>,
    pub sessions: Arc<SessionManager>,
    pub exposure: Arc<ExposureEngine>,
    pub breakers: Arc<BreakerPanel>,
    pub orders: Arc<OrderStore>,
    pub positions: Arc<PositionBook>,
    pub journal: Arc<Journal>,
    pub events: Arc<EventHub>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl EngineState {
    // -------------------------------------------------------------------------
    // Version tracking
    // -------------------------------------------------------------------------

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Error log
    // -------------------------------------------------------------------------

    pub fn push_error(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // -------------------------------------------------------------------------
    // Dashboard snapshot
    // -------------------------------------------------------------------------

    /// Full serialisable engine snapshot for `GET /api/v1/state` and the
    /// WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let exposure: Vec<ExposureEntry> = self
            .exposure
            .snapshot()
            .into_iter()
            .map(|(key, counters)| ExposureEntry { key, counters })
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: self.clock.now_ms() as i64,
            uptime_secs: self.start_time.elapsed().as_secs(),
            margin_mode: self.positions.mode().to_string(),
            symbols: self.config.read().symbols.clone(),
            accounts: self.accounts.all(),
            positions: self.positions.open_positions(),
            lp_health: self.sessions.health_snapshot(),
            exposure,
            breakers: self.breakers.all(),
            safe_mode_keys: self.exposure.safe_mode_keys(),
            journal_seq: self.journal.last_seq(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Journal snapshots and recovery
    // -------------------------------------------------------------------------

    /// Serialize the aggregate state the journal snapshot must cover.
    pub fn snapshot_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "accounts": self.accounts.all(),
            "openPositions": self.positions.open_positions(),
            "breakers": self.breakers.all(),
        })
    }

    /// Write a snapshot of aggregate state into the journal.
    pub fn write_snapshot(&self) {
        match self.journal.record_snapshot(self.snapshot_payload()) {
            Ok(seq) => info!(seq, "state snapshot journaled"),
            Err(e) => warn!(error = %e, "state snapshot failed"),
        }
    }

    /// Restore aggregate state from the latest journal snapshot: accounts,
    /// open positions, and breaker states come back verbatim; exposure
    /// counters are recomputed from the restored positions.
    pub fn restore_from_snapshot(&self) -> bool {
        let Some(snapshot) = self.journal.latest_snapshot() else {
            return false;
        };

        if let Some(accounts) = snapshot.payload.get("accounts") {
            if let Ok(accounts) = serde_json::from_value::<Vec<Account>>(accounts.clone()) {
                for account in accounts {
                    self.accounts.upsert(account);
                }
            }
        }
        if let Some(positions) = snapshot.payload.get("openPositions") {
            if let Ok(positions) = serde_json::from_value::<Vec<Position>>(positions.clone()) {
                self.positions.restore(positions);
            }
        }
        if let Some(breakers) = snapshot.payload.get("breakers") {
            if let Ok(breakers) = serde_json::from_value::<Vec<Breaker>>(breakers.clone()) {
                for breaker in breakers {
                    self.breakers.install(breaker);
                }
            }
        }

        // Counters always derive from the authoritative position set.
        self.exposure.rebuild(&self.positions.open_positions());

        info!(covered_seq = snapshot.covered_seq, "state restored from snapshot");
        true
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("version", &self.current_state_version())
            .finish()
    }
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEntry {
    #[serde(flatten)]
    pub key: ExposureKey,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub margin_mode: String,
    pub symbols: Vec<String>,
    pub accounts: Vec<Account>,
    pub positions: Vec<Position>,
    pub lp_health: Vec<LpHealth>,
    pub exposure: Vec<ExposureEntry>,
    pub breakers: Vec<Breaker>,
    pub safe_mode_keys: Vec<ExposureKey>,
    pub journal_seq: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
