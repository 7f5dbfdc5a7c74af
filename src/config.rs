// =============================================================================
// Engine Configuration — hot-loadable settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Persistence uses an
// atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ExecutionPath, MarginMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "USDJPY".to_string(),
        "AUDUSD".to_string(),
    ]
}

fn default_quote_stale_ttl_ms() -> u64 {
    2_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_misses() -> u32 {
    3
}

fn default_max_pending_per_account() -> usize {
    64
}

fn default_queue_depth_warn() -> usize {
    512
}

fn default_queue_depth_shed() -> usize {
    2_048
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_session_close() -> String {
    "21:55".to_string()
}

fn default_snapshot_interval_secs() -> u64 {
    300
}

fn default_request_deadline_ms() -> u64 {
    5_000
}

fn default_toxicity_abook_cutoff() -> u8 {
    75
}

fn default_max_open_positions_per_account() -> usize {
    100
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_lp_sessions() -> Vec<LpSessionConfig> {
    vec![LpSessionConfig {
        name: "LP-SIM".to_string(),
        adapter: LpAdapterKind::Simulated,
        endpoint: String::new(),
        api_key: String::new(),
        symbols: default_symbols(),
    }]
}

// =============================================================================
// LP session configuration
// =============================================================================

/// Which wire adapter a liquidity-provider session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LpAdapterKind {
    /// Built-in deterministic venue for demo and tests.
    Simulated,
    /// HMAC-signed REST venue.
    Rest,
}

impl Default for LpAdapterKind {
    fn default() -> Self {
        Self::Simulated
    }
}

/// Static settings for one liquidity-provider session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LpSessionConfig {
    pub name: String,
    #[serde(default)]
    pub adapter: LpAdapterKind,
    /// REST endpoint base URL; unused by the simulated adapter.
    #[serde(default)]
    pub endpoint: String,
    /// API key for signed requests; the secret comes from the environment as
    /// `MERIDIAN_LP_SECRET_<NAME>`.
    #[serde(default)]
    pub api_key: String,
    /// Symbols this venue quotes and accepts orders for.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Execution semantics -------------------------------------------------
    /// Position aggregation: separate long/short books, or one net position
    /// per (account, symbol).
    #[serde(default)]
    pub margin_mode: MarginMode,

    /// Fallback execution path when neither a routing rule nor a client
    /// profile decides.
    #[serde(default)]
    pub execution_mode_default: ExecutionPath,

    /// Markup applied to internalized fills, in pips.
    #[serde(default)]
    pub bbook_markup_pips: Decimal,

    /// Commission charged per lot per fill, in account currency.
    #[serde(default)]
    pub commission_per_lot: Decimal,

    // --- Symbols -------------------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Market data ---------------------------------------------------------
    /// Age after which an LP quote is ignored by best-price computation.
    #[serde(default = "default_quote_stale_ttl_ms")]
    pub quote_stale_ttl_ms: u64,

    // --- LP sessions ---------------------------------------------------------
    #[serde(default = "default_lp_sessions")]
    pub lp_sessions: Vec<LpSessionConfig>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed heartbeats before a session is torn down (the session degrades
    /// one miss earlier).
    #[serde(default = "default_heartbeat_misses")]
    pub heartbeat_misses: u32,

    // --- Backpressure --------------------------------------------------------
    #[serde(default = "default_max_pending_per_account")]
    pub max_pending_per_account: usize,

    #[serde(default = "default_queue_depth_warn")]
    pub queue_depth_warn: usize,

    #[serde(default = "default_queue_depth_shed")]
    pub queue_depth_shed: usize,

    // --- Housekeeping --------------------------------------------------------
    /// How often exposure counters are recomputed from the position book.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Daily boundary (HH:MM UTC) at which DAY orders expire.
    #[serde(default = "default_session_close")]
    pub session_close: String,

    /// How often aggregate state snapshots are written to the journal.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    // --- Requests ------------------------------------------------------------
    /// Default deadline applied to inbound commands.
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    // --- Routing -------------------------------------------------------------
    /// Toxicity score at or above which profile-driven routing flips to
    /// full external hedging.
    #[serde(default = "default_toxicity_abook_cutoff")]
    pub toxicity_abook_cutoff: u8,

    // --- Risk ----------------------------------------------------------------
    #[serde(default = "default_max_open_positions_per_account")]
    pub max_open_positions_per_account: usize,

    /// Hard cap on per-account daily loss (realized + unrealized), in
    /// account currency.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,

    // --- API -----------------------------------------------------------------
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Path for the append-only journal file; empty keeps the journal
    /// in memory only.
    #[serde(default)]
    pub journal_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            margin_mode: MarginMode::Hedging,
            execution_mode_default: ExecutionPath::BBook,
            bbook_markup_pips: Decimal::ZERO,
            commission_per_lot: Decimal::ZERO,
            symbols: default_symbols(),
            quote_stale_ttl_ms: default_quote_stale_ttl_ms(),
            lp_sessions: default_lp_sessions(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_misses: default_heartbeat_misses(),
            max_pending_per_account: default_max_pending_per_account(),
            queue_depth_warn: default_queue_depth_warn(),
            queue_depth_shed: default_queue_depth_shed(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            session_close: default_session_close(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            request_deadline_ms: default_request_deadline_ms(),
            toxicity_abook_cutoff: default_toxicity_abook_cutoff(),
            max_open_positions_per_account: default_max_open_positions_per_account(),
            daily_loss_limit: default_daily_loss_limit(),
            bind_addr: default_bind_addr(),
            journal_path: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            margin_mode = %config.margin_mode,
            lp_sessions = config.lp_sessions.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Parse `session_close` ("HH:MM") into minutes after midnight UTC.
    pub fn session_close_minutes(&self) -> Option<u32> {
        let (h, m) = self.session_close.split_once(':')?;
        let h: u32 = h.parse().ok()?;
        let m: u32 = m.parse().ok()?;
        if h < 24 && m < 60 {
            Some(h * 60 + m)
        } else {
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
