// =============================================================================
// Meridian Broker Engine — Main Entry Point
// =============================================================================
//
// Wires the components together and supervises the long-running tasks:
// LP sessions, the engine event loop, per-symbol exit watchers, exposure
// reconciliation, breaker cooldowns, TIF expiry sweeps, state snapshots,
// and the API server. Shutdown is cooperative: stop intake, flush the
// journal, save the config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounts;
mod api;
mod app_state;
mod breakers;
mod clock;
mod config;
mod dispatcher;
mod events;
mod exposure;
mod instruments;
mod journal;
mod lp;
mod market_data;
mod oms;
mod profile;
mod risk;
mod router;
mod types;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::accounts::{Account, AccountBook};
use crate::app_state::EngineState;
use crate::breakers::BreakerPanel;
use crate::clock::{Clock, SharedClock, SystemClock};
use crate::config::{EngineConfig, LpAdapterKind};
use crate::dispatcher::Dispatcher;
use crate::events::EventHub;
use crate::exposure::ExposureEngine;
use crate::instruments::InstrumentRegistry;
use crate::journal::{EventKind, Journal};
use crate::lp::{
    next_backoff_ms, LpAdapter, LpEvent, LpSession, SessionManager, SessionState, SignedRestLp,
    SimulatedLp,
};
use crate::market_data::{Quote, QuoteBoard};
use crate::oms::{watcher, OrderStore, PositionBook};
use crate::profile::ClientProfileStore;
use crate::risk::RiskEngine;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian broker engine starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["EURUSD".into(), "GBPUSD".into(), "USDJPY".into()];
    }

    info!(
        symbols = ?config.symbols,
        margin_mode = %config.margin_mode,
        lp_sessions = config.lp_sessions.len(),
        "configuration resolved"
    );

    // ── 2. Build components ──────────────────────────────────────────────
    let clock: SharedClock = Arc::new(SystemClock);

    let journal = if config.journal_path.is_empty() {
        Arc::new(Journal::in_memory(clock.clone()))
    } else {
        Arc::new(Journal::with_file(clock.clone(), &config.journal_path)?)
    };
    let recovered = journal.recover_from_file()?;
    if !recovered.is_empty() {
        info!(events = recovered.len(), "journal recovered");
    }

    let registry = Arc::new(InstrumentRegistry::with_fx_defaults(&config.symbols));
    let accounts = Arc::new(AccountBook::new());
    // Demo account so the engine is usable out of the box; production
    // accounts arrive through the account service.
    accounts.upsert(Account::new(
        "demo",
        Decimal::new(100_000, 0),
        Decimal::new(100, 0),
    ));

    let profiles = Arc::new(ClientProfileStore::new());
    let quotes = Arc::new(QuoteBoard::new(clock.clone(), config.quote_stale_ttl_ms));
    let sessions = Arc::new(SessionManager::new());
    let exposure = Arc::new(ExposureEngine::new(Decimal::new(1, 2)));
    let breakers = Arc::new(BreakerPanel::new(clock.clone()));
    let orders = Arc::new(OrderStore::new(clock.clone()));
    let positions = Arc::new(PositionBook::new(config.margin_mode, clock.clone()));
    let events = Arc::new(EventHub::new());
    let risk = Arc::new(RiskEngine::new(
        accounts.clone(),
        positions.clone(),
        breakers.clone(),
        config.max_open_positions_per_account,
        config.daily_loss_limit,
    ));

    // ── 3. LP sessions ───────────────────────────────────────────────────
    for lp_config in &config.lp_sessions {
        let adapter = match lp_config.adapter {
            LpAdapterKind::Simulated => {
                LpAdapter::Simulated(SimulatedLp::new(clock.clone()))
            }
            LpAdapterKind::Rest => {
                let secret_var = format!(
                    "MERIDIAN_LP_SECRET_{}",
                    lp_config.name.replace('-', "_").to_uppercase()
                );
                let secret = std::env::var(&secret_var).unwrap_or_default();
                if secret.is_empty() {
                    warn!(lp = %lp_config.name, var = %secret_var, "LP secret missing");
                }
                LpAdapter::Rest(SignedRestLp::new(
                    clock.clone(),
                    lp_config.endpoint.clone(),
                    lp_config.api_key.clone(),
                    secret,
                ))
            }
        };
        let session = Arc::new(LpSession::new(
            &lp_config.name,
            lp_config.symbols.clone(),
            adapter,
            config.heartbeat_misses,
            sessions.events_sender(),
            clock.clone(),
        ));
        sessions.add_session(session);
    }

    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        clock.clone(),
        registry.clone(),
        accounts.clone(),
        profiles.clone(),
        quotes.clone(),
        sessions.clone(),
        exposure.clone(),
        risk.clone(),
        breakers.clone(),
        orders.clone(),
        positions.clone(),
        journal.clone(),
        events.clone(),
    ));

    let state = Arc::new(EngineState {
        state_version: AtomicU64::new(1),
        config: RwLock::new(config.clone()),
        clock: clock.clone(),
        registry,
        accounts: accounts.clone(),
        profiles,
        quotes: quotes.clone(),
        sessions: sessions.clone(),
        exposure: exposure.clone(),
        breakers: breakers.clone(),
        orders: orders.clone(),
        positions: positions.clone(),
        journal: journal.clone(),
        events,
        recent_errors: RwLock::new(Vec::new()),
        start_time: std::time::Instant::now(),
    });

    // Recover aggregate state if a snapshot survived.
    if state.restore_from_snapshot() {
        info!("aggregate state restored from journal snapshot");
    }
    let _ = journal.append(EventKind::EngineStarted, serde_json::json!({}));

    // ── 4. Session supervisors & simulated quote pumps ───────────────────
    let sim_config = config.clone();
    for session in sessions.sessions() {
        let heartbeat_ms = config.heartbeat_interval_ms;
        let supervised = session.clone();
        tokio::spawn(async move {
            run_session_supervisor(supervised, heartbeat_ms).await;
        });

        // Simulated venues stream synthetic quotes so the engine runs
        // end-to-end without external connectivity.
        let is_simulated = sim_config
            .lp_sessions
            .iter()
            .any(|c| c.name == session.name() && c.adapter == LpAdapterKind::Simulated);
        if is_simulated {
            let pump_session = session.clone();
            let pump_clock = clock.clone();
            let pump_sender = sessions.events_sender();
            let pump_symbols = sim_config
                .lp_sessions
                .iter()
                .find(|c| c.name == session.name())
                .map(|c| c.symbols.clone())
                .unwrap_or_default();
            let (warn_depth, shed_depth) =
                (sim_config.queue_depth_warn, sim_config.queue_depth_shed);
            tokio::spawn(async move {
                run_sim_quote_pump(
                    pump_session,
                    pump_symbols,
                    pump_clock,
                    pump_sender,
                    warn_depth,
                    shed_depth,
                )
                .await;
            });
        }
    }

    // ── 5. Engine event loop (LP fan-in) ─────────────────────────────────
    {
        let mut rx = sessions.take_events();
        let loop_state = state.clone();
        let loop_dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    LpEvent::Quote(quote) => {
                        if let Some(session) = loop_state.sessions.session(&quote.lp) {
                            session.mark_streaming();
                        }
                        loop_state.quotes.publish(quote);
                        loop_state.increment_version();
                    }
                    LpEvent::Fill(fill) => {
                        loop_dispatcher.apply_external_fill(fill).await;
                        loop_state.increment_version();
                    }
                    LpEvent::Reject {
                        lp,
                        client_order_id,
                        reason,
                    } => {
                        loop_state.push_error(
                            format!("venue {lp} rejected order {client_order_id}: {reason}"),
                            Some("lpReject".to_string()),
                        );
                    }
                    LpEvent::StatusChange { lp, state: session_state } => {
                        let _ = loop_state.journal.append(
                            EventKind::SessionTransition,
                            serde_json::json!({ "lp": lp, "state": session_state }),
                        );
                        loop_state.increment_version();
                    }
                    LpEvent::OrderUnknown {
                        lp,
                        client_order_id,
                    } => {
                        warn!(lp = %lp, order_id = %client_order_id, "order fate unknown after session loss");
                        loop_state.orders.mark_uncertain(&client_order_id);
                        let _ = loop_state.journal.append(
                            EventKind::OrderUncertain,
                            serde_json::json!({ "orderId": client_order_id, "lp": lp }),
                        );
                    }
                }
            }
        });
    }

    // ── 6. Per-symbol exit watchers ──────────────────────────────────────
    for symbol in &config.symbols {
        tokio::spawn(watcher::run_symbol_watcher(
            symbol.clone(),
            quotes.clone(),
            positions.clone(),
            breakers.clone(),
            dispatcher.clone(),
            journal.clone(),
        ));
    }
    tokio::spawn(watcher::run_stale_monitor(
        quotes.clone(),
        positions.clone(),
        1_000,
    ));
    info!(count = config.symbols.len(), "exit watchers launched");

    // ── 7. Exposure reconciliation loop ──────────────────────────────────
    {
        let recon_dispatcher = dispatcher.clone();
        let interval = config.reconcile_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                recon_dispatcher.reconcile_exposure();
            }
        });
    }

    // ── 8. Breaker cooldown sweep ────────────────────────────────────────
    {
        let sweep_breakers = breakers.clone();
        let sweep_journal = journal.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                for t in sweep_breakers.sweep() {
                    let _ = sweep_journal.append(
                        EventKind::BreakerTransition,
                        serde_json::json!({ "name": t.name, "from": t.from, "to": t.to }),
                    );
                }
            }
        });
    }

    // ── 9. TIF expiry sweep & daily rollover ─────────────────────────────
    {
        let sweep_state = state.clone();
        let close_minute = config.session_close_minutes().unwrap_or(21 * 60 + 55);
        let sweep_clock = clock.clone();
        tokio::spawn(async move {
            let mut last_minute = minute_of_day(sweep_clock.now_ms());
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let now = sweep_clock.now_ms();
                let minute = minute_of_day(now);
                let boundary = crossed(last_minute, minute, close_minute);
                last_minute = minute;

                let expired = sweep_state.orders.sweep_expiries(now, boundary);
                for order in &expired {
                    let _ = sweep_state.journal.append(
                        EventKind::OrderExpired,
                        serde_json::json!({ "orderId": order.id, "tif": order.tif }),
                    );
                    sweep_state.events.publish_order(order.clone());
                }
                if boundary {
                    info!("session close boundary: rolling daily counters");
                    sweep_state.accounts.roll_day();
                    sweep_state.breakers.reset_references();
                }
                if !expired.is_empty() {
                    sweep_state.increment_version();
                }
            }
        });
    }

    // ── 10. Periodic state snapshots ─────────────────────────────────────
    {
        let snap_state = state.clone();
        let interval = config.snapshot_interval_secs.max(10);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval));
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                snap_state.write_snapshot();
            }
        });
    }

    // ── 11. API server ───────────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| config.bind_addr.clone());
    {
        let api_context = api::rest::ApiContext {
            state: state.clone(),
            dispatcher: dispatcher.clone(),
        };
        let addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_context);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 12. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    state.write_snapshot();
    let _ = journal.append(EventKind::EngineStopped, serde_json::json!({}));
    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Meridian shut down complete");
    Ok(())
}

// =============================================================================
// Supervisors
// =============================================================================

/// Keep one session alive: connect with jittered backoff, then treat each
/// heartbeat interval as a liveness deadline. Simulated venues are always
/// reachable; REST venues are probed by their open-orders endpoint through
/// the session's reconcile call.
async fn run_session_supervisor(session: Arc<LpSession>, heartbeat_interval_ms: u64) {
    let mut attempt: u32 = 0;
    loop {
        match session.state() {
            SessionState::Disconnected => {
                if attempt > 0 {
                    let backoff = next_backoff_ms(attempt - 1);
                    tokio::time::sleep(tokio::time::Duration::from_millis(backoff)).await;
                }
                session.begin_connect();
                session.mark_connected();
                session.reconcile_open_orders().await;
                attempt += 1;
            }
            _ => {
                tokio::time::sleep(tokio::time::Duration::from_millis(heartbeat_interval_ms))
                    .await;
                // The in-process venues answer instantly; a real wire
                // adapter reports a miss when its probe fails.
                session.record_heartbeat_ok();
                attempt = 0;
            }
        }
    }
}

/// Random-walk quote stream for a simulated venue. Quotes are the lowest
/// priority traffic on the event channel: above the shed threshold the pump
/// drops the whole tick rather than crowding out fills.
async fn run_sim_quote_pump(
    session: Arc<LpSession>,
    symbols: Vec<String>,
    clock: SharedClock,
    sender: tokio::sync::mpsc::Sender<LpEvent>,
    queue_depth_warn: usize,
    queue_depth_shed: usize,
) {
    // Seed mids roughly where majors trade.
    let mut mids: Vec<(String, f64)> = symbols
        .into_iter()
        .map(|s| {
            let seed = match s.as_str() {
                "EURUSD" => 1.1000,
                "GBPUSD" => 1.2700,
                "USDJPY" => 148.00,
                "AUDUSD" => 0.6600,
                _ => 1.0000,
            };
            (s, seed)
        })
        .collect();
    let mut seq: u64 = 0;

    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(250));
    loop {
        ticker.tick().await;
        if !session.state().accepts_orders() {
            continue;
        }

        let queue_depth = sender.max_capacity() - sender.capacity();
        if queue_depth >= queue_depth_shed {
            warn!(queue_depth, "event queue saturated, shedding quote tick");
            continue;
        }
        if queue_depth >= queue_depth_warn {
            warn!(queue_depth, "event queue depth high");
        }

        for (symbol, mid) in mids.iter_mut() {
            let step = {
                let mut rng = rand::thread_rng();
                rng.gen_range(-0.00005..0.00005)
            };
            *mid = (*mid + *mid * step).max(0.0001);
            let spread = *mid * 0.00018;
            seq += 1;

            let bid = Decimal::from_f64_retain(*mid - spread / 2.0)
                .unwrap_or_default()
                .round_dp(5);
            let ask = Decimal::from_f64_retain(*mid + spread / 2.0)
                .unwrap_or_default()
                .round_dp(5);
            if bid.is_zero() {
                continue;
            }

            let quote = Quote {
                symbol: symbol.clone(),
                bid,
                ask,
                bid_size: Decimal::new(1_000_000, 0),
                ask_size: Decimal::new(1_000_000, 0),
                lp: session.name().to_string(),
                seq,
                ts: clock.now_ms(),
            };
            if sender.send(LpEvent::Quote(quote)).await.is_err() {
                return;
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn minute_of_day(now_ms: u64) -> u32 {
    use chrono::{TimeZone, Timelike, Utc};
    let dt = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    dt.hour() * 60 + dt.minute()
}

/// Whether the session-close minute falls inside the half-open interval
/// (`prev`, `current`], accounting for midnight wrap.
fn crossed(prev: u32, current: u32, boundary: u32) -> bool {
    if prev == current {
        return false;
    }
    if prev < current {
        boundary > prev && boundary <= current
    } else {
        boundary > prev || boundary <= current
    }
}

// =============================================================================
// Tests
// =============================================================================
