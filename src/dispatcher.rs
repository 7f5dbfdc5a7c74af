// =============================================================================
// Dispatcher — the end-to-end order pipeline
// =============================================================================
//
// Sequence per new order:
//
//   idempotency -> risk gate -> routing -> exposure verdict -> record ->
//   execute (internal fill | venue submit | both) -> books -> journal ->
//   publish
//
// The pipeline runs serially per account (causal ordering per account and
// symbol) and concurrently across accounts. Each request carries a deadline;
// requests that are already past it when they reach the head of the line are
// refused with `timeout`.
//
// Exactly-once: the (account, client order id) pair keys a stored outcome.
// A duplicate with the identical body returns the stored response; a
// duplicate with a different body is refused.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountBook;
use crate::breakers::BreakerPanel;
use crate::clock::{Clock, SharedClock};
use crate::config::EngineConfig;
use crate::events::EventHub;
use crate::exposure::{ExposureEngine, ExposureEvent, ExposureVerdict};
use crate::instruments::{Instrument, InstrumentRegistry};
use crate::journal::{EventKind, Journal};
use crate::lp::{LpFill, SessionManager, SubmitRequest};
use crate::market_data::{BestQuote, QuoteBoard};
use crate::oms::{
    ExitTrigger, Fill, FillIntent, NewOrder, Order, OrderStore, PositionBook,
};
use crate::profile::ClientProfileStore;
use crate::risk::{OrderIntent, RiskEngine};
use crate::router::{self, RoutePath, RoutingDecision, RoutingRule};
use crate::types::{
    ExecutionPath, LiquidityRole, OrderKind, OrderState, RejectReason, Rejection, Side, Tif,
};

/// Quantity step used when splitting hybrid legs and reducing sizes.
const QTY_STEP: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01

/// A client order request as the dispatcher receives it.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub account_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub tif: Tif,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub good_till: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_distance: Option<Decimal>,
    /// Absolute deadline, epoch millis. Defaults from config when absent.
    #[serde(skip)]
    pub deadline_ms: Option<u64>,
}

/// The dispatcher's answer to a place-order command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<OrderState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    pub fills: Vec<Fill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl PlaceOrderResponse {
    fn rejected(order_id: Option<String>, rejection: Rejection) -> Self {
        Self {
            order_id,
            state: Some(OrderState::Rejected),
            routing: None,
            fills: Vec::new(),
            rejection: Some(rejection),
        }
    }
}

struct StoredOutcome {
    body_hash: String,
    response: PlaceOrderResponse,
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    clock: SharedClock,
    registry: Arc<InstrumentRegistry>,
    accounts: Arc<AccountBook>,
    profiles: Arc<ClientProfileStore>,
    quotes: Arc<QuoteBoard>,
    sessions: Arc<SessionManager>,
    exposure: Arc<ExposureEngine>,
    risk: Arc<RiskEngine>,
    breakers: Arc<BreakerPanel>,
    orders: Arc<OrderStore>,
    positions: Arc<PositionBook>,
    journal: Arc<Journal>,
    events: Arc<EventHub>,
    rules: RwLock<Arc<Vec<RoutingRule>>>,
    idempotency: RwLock<HashMap<(String, String), StoredOutcome>>,
    account_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_path: ExecutionPath,
    bbook_markup_pips: Decimal,
    commission_per_lot: Decimal,
    toxicity_cutoff: u8,
    max_pending_per_account: usize,
    request_deadline_ms: u64,
}

#[allow(clippy::too_many_arguments)]
impl Dispatcher {
    pub fn new(
        config: &EngineConfig,
        clock: SharedClock,
        registry: Arc<InstrumentRegistry>,
        accounts: Arc<AccountBook>,
        profiles: Arc<ClientProfileStore>,
        quotes: Arc<QuoteBoard>,
        sessions: Arc<SessionManager>,
        exposure: Arc<ExposureEngine>,
        risk: Arc<RiskEngine>,
        breakers: Arc<BreakerPanel>,
        orders: Arc<OrderStore>,
        positions: Arc<PositionBook>,
        journal: Arc<Journal>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            clock,
            registry,
            accounts,
            profiles,
            quotes,
            sessions,
            exposure,
            risk,
            breakers,
            orders,
            positions,
            journal,
            events,
            rules: RwLock::new(Arc::new(Vec::new())),
            idempotency: RwLock::new(HashMap::new()),
            account_locks: Mutex::new(HashMap::new()),
            default_path: config.execution_mode_default,
            bbook_markup_pips: config.bbook_markup_pips,
            commission_per_lot: config.commission_per_lot,
            toxicity_cutoff: config.toxicity_abook_cutoff,
            max_pending_per_account: config.max_pending_per_account,
            request_deadline_ms: config.request_deadline_ms,
        }
    }

    /// Swap the routing rule set atomically.
    pub fn set_rules(&self, rules: Vec<RoutingRule>) {
        info!(count = rules.len(), "routing rules installed");
        *self.rules.write() = Arc::new(rules);
    }

    pub fn rules(&self) -> Arc<Vec<RoutingRule>> {
        self.rules.read().clone()
    }

    fn account_lock(&self, account_id: &str) -> Arc<AsyncMutex<()>> {
        self.account_locks
            .lock()
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn journal_or_uncertain(&self, order_id: Option<&str>, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.journal.append(kind, payload) {
            warn!(error = %e, "journal write failed");
            if let Some(id) = order_id {
                self.orders.mark_uncertain(id);
                let _ = self
                    .journal
                    .append(EventKind::OrderUncertain, serde_json::json!({ "orderId": id }));
            }
        }
    }

    // -------------------------------------------------------------------------
    // placeOrder
    // -------------------------------------------------------------------------

    pub async fn place_order(&self, req: PlaceOrderRequest) -> PlaceOrderResponse {
        self.place(req, FillIntent::Open).await
    }

    async fn place(&self, req: PlaceOrderRequest, intent: FillIntent) -> PlaceOrderResponse {
        // --- Validation -------------------------------------------------------
        if let Some(rejection) = validate(&req) {
            self.journal_or_uncertain(
                None,
                EventKind::OrderRejected,
                serde_json::json!({
                    "clientOrderId": req.client_order_id,
                    "reason": rejection.reason,
                }),
            );
            return PlaceOrderResponse::rejected(None, rejection);
        }
        let Some(instrument) = self.registry.get(&req.symbol) else {
            return PlaceOrderResponse::rejected(None, RejectReason::UnknownSymbol.into());
        };

        let key = (req.account_id.clone(), req.client_order_id.clone());
        let body_hash = hash_body(&req);

        // --- Idempotency fast path -------------------------------------------
        if let Some(resp) = self.check_duplicate(&key, &body_hash) {
            return resp;
        }

        // --- Serialize per account -------------------------------------------
        let lock = self.account_lock(&req.account_id);
        let _guard = lock.lock().await;

        // A concurrent duplicate may have won the race for the lock.
        if let Some(resp) = self.check_duplicate(&key, &body_hash) {
            return resp;
        }

        // Deadline at the head of the line.
        let deadline = req
            .deadline_ms
            .unwrap_or_else(|| self.clock.now_ms() + self.request_deadline_ms);
        if self.clock.now_ms() > deadline {
            let rejection = Rejection::new(RejectReason::Timeout);
            self.journal_or_uncertain(
                None,
                EventKind::OrderRejected,
                serde_json::json!({ "clientOrderId": req.client_order_id, "reason": "timeout" }),
            );
            let resp = PlaceOrderResponse::rejected(None, rejection);
            self.store_outcome(key, body_hash, resp.clone());
            return resp;
        }

        // Backpressure per account.
        if self.orders.pending_count(&req.account_id) >= self.max_pending_per_account {
            let resp =
                PlaceOrderResponse::rejected(None, RejectReason::BackpressureShed.into());
            self.store_outcome(key, body_hash, resp.clone());
            return resp;
        }

        let resp = self.run_pipeline(&req, &instrument, intent).await;
        self.store_outcome(key, body_hash, resp.clone());
        resp
    }

    fn check_duplicate(
        &self,
        key: &(String, String),
        body_hash: &str,
    ) -> Option<PlaceOrderResponse> {
        let stored = self.idempotency.read();
        let outcome = stored.get(key)?;
        if outcome.body_hash == body_hash {
            debug!(account_id = %key.0, client_order_id = %key.1, "duplicate request, returning stored outcome");
            Some(outcome.response.clone())
        } else {
            Some(PlaceOrderResponse::rejected(
                outcome.response.order_id.clone(),
                RejectReason::DuplicateClientOrderId.into(),
            ))
        }
    }

    fn store_outcome(&self, key: (String, String), body_hash: String, response: PlaceOrderResponse) {
        self.idempotency
            .write()
            .insert(key, StoredOutcome { body_hash, response });
    }

    async fn run_pipeline(
        &self,
        req: &PlaceOrderRequest,
        instrument: &Instrument,
        intent: FillIntent,
    ) -> PlaceOrderResponse {
        let now = self.clock.now_ms();

        // Reference price for risk and execution.
        let snapshot = self.quotes.snapshot(&req.symbol);
        let ref_price = match reference_price(req, snapshot.as_ref()) {
            Ok(px) => px,
            Err(rejection) => {
                self.journal_or_uncertain(
                    None,
                    EventKind::OrderRejected,
                    serde_json::json!({
                        "clientOrderId": req.client_order_id,
                        "reason": rejection.reason,
                    }),
                );
                return PlaceOrderResponse::rejected(None, rejection);
            }
        };

        // Record first so every downstream transition has an order id.
        let order = self.orders.create(NewOrder {
            account_id: req.account_id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            kind: req.kind,
            qty: req.qty,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            tif: req.tif,
            good_till: req.good_till,
            sl: req.sl,
            tp: req.tp,
            trailing_distance: req.trailing_distance,
            close_position_id: match &intent {
                FillIntent::Close { position_id } => position_id.clone(),
                FillIntent::Open => None,
            },
        });

        // --- Risk gate --------------------------------------------------------
        // Closes only ever reduce risk; gating them on margin or breakers
        // would trap accounts in losing positions.
        let gated = matches!(intent, FillIntent::Open);
        let risk_intent = OrderIntent {
            account_id: &req.account_id,
            symbol: &req.symbol,
            side: req.side,
            qty: req.qty,
            ref_price,
        };
        if let Err(rejection) = if gated {
            self.risk.pre_trade(&risk_intent, instrument, now)
        } else {
            Ok(())
        } {
            let _ = self.orders.reject(&order.id, rejection.reason);
            self.journal_or_uncertain(
                Some(&order.id),
                EventKind::OrderRejected,
                serde_json::json!({ "orderId": order.id, "reason": rejection.reason }),
            );
            self.publish_order(&order.id);
            return PlaceOrderResponse::rejected(Some(order.id), rejection);
        }

        // --- Exposure and routing --------------------------------------------
        // Closes shrink the book; only opening flow is limit-checked.
        let (verdict, impact, exp_events) = if gated {
            self.exposure.pre_trade(
                &req.symbol,
                &req.account_id,
                None,
                req.side,
                req.qty,
                instrument.contract_size,
            )
        } else {
            (
                ExposureVerdict::Accept,
                crate::exposure::ExposureImpact::default(),
                Vec::new(),
            )
        };
        self.journal_exposure_events(&exp_events);

        let profile = self.profiles.get(&req.account_id);
        let rules = self.rules();
        let lp_health = self.sessions.health_snapshot();
        let decision = router::decide(&router::RouteInputs {
            account_id: &req.account_id,
            client_order_id: &req.client_order_id,
            symbol: &req.symbol,
            side: req.side,
            qty: req.qty,
            minute_of_day: minute_of_day(now),
            profile: &profile,
            rules: rules.as_slice(),
            lp_health: &lp_health,
            impact,
            default_path: self.default_path,
            toxicity_cutoff: self.toxicity_cutoff,
        });

        for alert in &decision.alerts {
            self.journal_or_uncertain(
                Some(&order.id),
                EventKind::ComplianceAlert,
                serde_json::json!({ "orderId": order.id, "rule": alert }),
            );
        }

        match decision.path {
            RoutePath::Reject => {
                let reason = decision.reject_reason.unwrap_or(RejectReason::RoutingRejected);
                let _ = self.orders.reject(&order.id, reason);
                self.journal_or_uncertain(
                    Some(&order.id),
                    EventKind::OrderRejected,
                    serde_json::json!({ "orderId": order.id, "reason": reason }),
                );
                self.publish_order(&order.id);
                let mut resp = PlaceOrderResponse::rejected(Some(order.id), reason.into());
                resp.routing = Some(decision);
                return resp;
            }
            RoutePath::Hold => {
                self.journal_or_uncertain(
                    Some(&order.id),
                    EventKind::OrderHeld,
                    serde_json::json!({ "orderId": order.id, "reason": decision.reason }),
                );
                self.publish_order(&order.id);
                return PlaceOrderResponse {
                    order_id: Some(order.id.clone()),
                    state: Some(OrderState::Pending),
                    routing: Some(decision),
                    fills: Vec::new(),
                    rejection: None,
                };
            }
            _ => {}
        }

        // Exposure verdict folds into the routed plan.
        let mut decision = decision;
        let mut qty = req.qty;
        match verdict {
            ExposureVerdict::Accept => {}
            ExposureVerdict::Reject => {
                let _ = self.orders.reject(&order.id, RejectReason::ExposureBreach);
                self.journal_or_uncertain(
                    Some(&order.id),
                    EventKind::OrderRejected,
                    serde_json::json!({ "orderId": order.id, "reason": "exposureBreach" }),
                );
                self.publish_order(&order.id);
                let mut resp = PlaceOrderResponse::rejected(
                    Some(order.id),
                    RejectReason::ExposureBreach.into(),
                );
                resp.routing = Some(decision);
                return resp;
            }
            ExposureVerdict::Reduce { new_qty } => {
                if new_qty <= Decimal::ZERO {
                    let _ = self.orders.reject(&order.id, RejectReason::ExposureBreach);
                    self.journal_or_uncertain(
                        Some(&order.id),
                        EventKind::OrderRejected,
                        serde_json::json!({ "orderId": order.id, "reason": "exposureBreach" }),
                    );
                    self.publish_order(&order.id);
                    let mut resp = PlaceOrderResponse::rejected(
                        Some(order.id),
                        RejectReason::ExposureBreach.into(),
                    );
                    resp.routing = Some(decision);
                    return resp;
                }
                if self.orders.reduce_qty(&order.id, new_qty).is_ok() {
                    qty = new_qty;
                }
            }
            ExposureVerdict::AcceptWithHedge { hedge_pct } => {
                // The breaching share must leave the book.
                match decision.path {
                    RoutePath::BBook => {
                        if let Some(lp) = router::best_lp(&lp_health, &req.symbol) {
                            decision.path = RoutePath::Hybrid;
                            decision.lp_name = Some(lp);
                            decision.hedge_pct = Some(hedge_pct);
                        }
                    }
                    RoutePath::Hybrid => {
                        let current = decision.hedge_pct.unwrap_or(0);
                        decision.hedge_pct = Some(current.max(hedge_pct));
                    }
                    // Fully external already satisfies the hedge.
                    _ => {}
                }
            }
        }

        // --- Accept and execute ----------------------------------------------
        let path = match decision.path {
            RoutePath::ABook => ExecutionPath::ABook,
            RoutePath::BBook => ExecutionPath::BBook,
            RoutePath::Hybrid => ExecutionPath::Hybrid,
            _ => unreachable!("terminal paths handled above"),
        };
        let correlation_id = if path == ExecutionPath::Hybrid {
            Some(Uuid::new_v4().to_string())
        } else {
            None
        };
        let accepted = match self.orders.accept(&order.id, path, correlation_id) {
            Ok(o) => o,
            Err(rejection) => return PlaceOrderResponse::rejected(Some(order.id), rejection),
        };
        self.journal_or_uncertain(
            Some(&accepted.id),
            EventKind::OrderAccepted,
            serde_json::json!({
                "orderId": accepted.id,
                "accountId": accepted.account_id,
                "symbol": accepted.symbol,
                "side": accepted.side,
                "qty": qty.to_string(),
                "path": path,
                "lp": decision.lp_name,
            }),
        );

        self.execute(&accepted, qty, &decision, snapshot.as_ref(), instrument)
            .await;

        let final_order = self.orders.get(&accepted.id).unwrap_or(accepted);
        self.publish_order(&final_order.id);
        PlaceOrderResponse {
            order_id: Some(final_order.id.clone()),
            state: Some(final_order.state),
            routing: Some(decision),
            fills: final_order.fills.clone(),
            rejection: final_order.reject_reason.map(Rejection::new),
        }
    }

    /// Execute an accepted order along its path. Resting orders (stops,
    /// non-marketable limits) stay in the book and wake up on ticks.
    async fn execute(
        &self,
        order: &Order,
        qty: Decimal,
        decision: &RoutingDecision,
        snapshot: Option<&BestQuote>,
        instrument: &Instrument,
    ) {
        let marketable = is_marketable(order, snapshot);
        if !marketable {
            match order.tif {
                // One shot at the book and nothing came back.
                Tif::Ioc | Tif::Fok => {
                    if let Ok(o) = self.orders.cancel(&order.id) {
                        self.journal_or_uncertain(
                            Some(&o.id),
                            EventKind::OrderCancelled,
                            serde_json::json!({ "orderId": o.id, "tif": o.tif }),
                        );
                    }
                }
                _ => debug!(order_id = %order.id, "order resting"),
            }
            return;
        }

        let Some(best) = snapshot else { return };
        let book_price = match order.side {
            Side::Buy => best.ask,
            Side::Sell => best.bid,
        };

        match decision.path {
            RoutePath::BBook => {
                let price = self.marked_up(book_price, order.side, instrument);
                self.fill_internal(&order.id, qty, price).await;
            }
            RoutePath::ABook => {
                let lp = decision.lp_name.clone().unwrap_or_default();
                self.submit_leg(order, &lp, qty, book_price).await;
            }
            RoutePath::Hybrid => {
                let hedge_pct = Decimal::from(decision.hedge_pct.unwrap_or(50));
                let qty_external = round_step(qty * hedge_pct / Decimal::ONE_HUNDRED);
                let qty_internal = qty - qty_external;
                let lp = decision.lp_name.clone().unwrap_or_default();
                if qty_external > Decimal::ZERO {
                    self.submit_leg(order, &lp, qty_external, book_price).await;
                }
                if qty_internal > Decimal::ZERO {
                    let price = self.marked_up(book_price, order.side, instrument);
                    self.fill_internal(&order.id, qty_internal, price).await;
                }
            }
            _ => {}
        }

        // IOC cancels whatever one attempt left unfilled.
        if order.tif == Tif::Ioc {
            if let Some(current) = self.orders.get(&order.id) {
                if !current.state.is_terminal() && current.remaining > Decimal::ZERO {
                    if let Ok(o) = self.orders.cancel(&order.id) {
                        self.journal_or_uncertain(
                            Some(&o.id),
                            EventKind::OrderCancelled,
                            serde_json::json!({ "orderId": o.id, "tif": "IOC" }),
                        );
                    }
                }
            }
        }
    }

    fn marked_up(&self, book_price: Decimal, side: Side, instrument: &Instrument) -> Decimal {
        let markup = self.bbook_markup_pips * instrument.pip();
        match side {
            Side::Buy => book_price + markup,
            Side::Sell => book_price - markup,
        }
    }

    async fn submit_leg(&self, order: &Order, lp: &str, qty: Decimal, price_hint: Decimal) {
        let request = SubmitRequest {
            // The engine order id doubles as the venue client order id so
            // venue events map straight back.
            client_order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty,
            price_hint,
        };
        match self.sessions.submit(lp, request).await {
            Ok(ack) => {
                debug!(order_id = %order.id, lp, lp_order_id = %ack.lp_order_id, "venue submit acked");
            }
            Err(rejection) => {
                warn!(order_id = %order.id, lp, reason = %rejection, "venue submit failed");
                let _ = self.orders.reject(&order.id, rejection.reason);
                self.journal_or_uncertain(
                    Some(&order.id),
                    EventKind::OrderRejected,
                    serde_json::json!({ "orderId": order.id, "reason": rejection.reason }),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fill application (shared by internal fills and venue fills)
    // -------------------------------------------------------------------------

    /// Synthesize an internal (book) fill.
    async fn fill_internal(&self, order_id: &str, qty: Decimal, price: Decimal) {
        self.apply_fill(order_id, qty, price, "BOOK", LiquidityRole::Taker, None)
            .await;
    }

    /// A fill reported by a venue session. Unknown orders are logged and
    /// refused (duplicates or reordered events after reconnect).
    pub async fn apply_external_fill(&self, fill: LpFill) {
        if self.orders.get(&fill.client_order_id).is_none() {
            warn!(client_order_id = %fill.client_order_id, lp = %fill.lp, "fill for unknown order refused");
            self.journal_or_uncertain(
                None,
                EventKind::OrderRejected,
                serde_json::json!({
                    "clientOrderId": fill.client_order_id,
                    "lp": fill.lp,
                    "reason": "unknownOrder",
                }),
            );
            return;
        }
        let lp = fill.lp.clone();
        self.apply_fill(
            &fill.client_order_id,
            fill.qty,
            fill.price,
            &lp,
            LiquidityRole::Taker,
            Some(&lp),
        )
        .await;
    }

    async fn apply_fill(
        &self,
        order_id: &str,
        qty: Decimal,
        price: Decimal,
        venue: &str,
        liquidity: LiquidityRole,
        lp: Option<&str>,
    ) {
        let (order, fill) =
            match self.orders.apply_fill(order_id, qty, price, liquidity, venue) {
                Ok(pair) => pair,
                Err(rejection) => {
                    warn!(order_id, reason = %rejection, "fill refused");
                    return;
                }
            };

        let Some(instrument) = self.registry.get(&order.symbol) else {
            return;
        };

        let intent = match &order.close_position_id {
            Some(id) => FillIntent::Close {
                position_id: Some(id.clone()),
            },
            None => FillIntent::Open,
        };

        let app = self.positions.apply_fill(
            &order.account_id,
            &order.symbol,
            order.side,
            qty,
            price,
            instrument.contract_size,
            intent,
        );

        // Protective levels from the order attach to a freshly opened position.
        for position_id in &app.opened {
            if order.sl.is_some() || order.tp.is_some() || order.trailing_distance.is_some() {
                let _ = self.positions.set_protections(
                    position_id,
                    order.sl,
                    order.tp,
                    order.trailing_distance,
                );
            }
        }

        // Commission at the fill event.
        let commission = self.commission_per_lot * qty;
        self.accounts
            .apply_realized(&order.account_id, app.realized_pnl, commission);
        self.refresh_account_marks(&order.account_id);

        // Exposure counters move in the same serialized path as the fill.
        let exp_events = self.exposure.apply_fill(
            &order.symbol,
            &order.account_id,
            lp,
            app.net_delta,
            app.gross_delta,
        );
        self.journal_exposure_events(&exp_events);
        self.publish_exposure(&order.symbol, &order.account_id);

        // Daily-loss breakers watch the account's running day P&L.
        if let Some(account) = self.accounts.get(&order.account_id) {
            let day_pnl = account.day_realized_pnl
                + self.positions.unrealized_for_account(&order.account_id);
            if day_pnl < Decimal::ZERO {
                for t in self.breakers.on_daily_loss(&order.account_id, -day_pnl) {
                    self.journal_or_uncertain(
                        None,
                        EventKind::BreakerTransition,
                        serde_json::json!({ "name": t.name, "from": t.from, "to": t.to }),
                    );
                }
            }
        }

        self.journal_or_uncertain(
            Some(&order.id),
            EventKind::OrderFilled,
            serde_json::json!({
                "orderId": order.id,
                "accountId": order.account_id,
                "symbol": order.symbol,
                "side": order.side,
                "qty": fill.qty.to_string(),
                "price": fill.price.to_string(),
                "venue": venue,
                "realizedPnl": app.realized_pnl.to_string(),
                "netDelta": app.net_delta.to_string(),
                "grossDelta": app.gross_delta.to_string(),
                "opened": app.opened,
                "closed": app.closed,
            }),
        );

        for position_id in app.opened.iter() {
            self.journal_or_uncertain(
                Some(&order.id),
                EventKind::PositionOpened,
                serde_json::json!({ "positionId": position_id, "orderId": order.id }),
            );
            self.publish_position(position_id);
        }
        for position_id in app.closed.iter() {
            self.journal_or_uncertain(
                Some(&order.id),
                EventKind::PositionClosed,
                serde_json::json!({
                    "positionId": position_id,
                    "orderId": order.id,
                    "realizedPnl": app.realized_pnl.to_string(),
                }),
            );
            self.publish_position(position_id);
        }
        // Reductions that did not close still changed the book.
        if app.opened.is_empty() && app.closed.is_empty() {
            for pos in self.positions.positions_for_account(&order.account_id) {
                if pos.symbol == order.symbol {
                    self.events.publish_position(pos);
                }
            }
        }

        self.publish_order(&order.id);
    }

    /// Recompute an account's equity and margin figures from its open
    /// positions. Called after fills and on every mark update.
    pub fn refresh_account_marks(&self, account_id: &str) {
        let Some(account) = self.accounts.get(account_id) else {
            return;
        };
        let unrealized = self.positions.unrealized_for_account(account_id);
        let notional = self.positions.notional_for_account(account_id);
        let margin_used = if account.leverage.is_zero() {
            notional
        } else {
            notional / account.leverage
        };
        self.accounts.update_marks(account_id, unrealized, margin_used);
    }

    fn journal_exposure_events(&self, events: &[ExposureEvent]) {
        for event in events {
            let (kind, payload) = match event {
                ExposureEvent::Warning { key, utilization_pct } => (
                    EventKind::ExposureUpdated,
                    serde_json::json!({
                        "symbol": key.symbol,
                        "scope": key.scope.to_string(),
                        "utilizationPct": utilization_pct,
                        "level": "warning",
                    }),
                ),
                ExposureEvent::Breach { key, utilization_pct, action } => (
                    EventKind::ExposureBreach,
                    serde_json::json!({
                        "symbol": key.symbol,
                        "scope": key.scope.to_string(),
                        "utilizationPct": utilization_pct,
                        "action": action,
                    }),
                ),
                ExposureEvent::HedgeRequest { symbol, hedge_pct, qty } => (
                    EventKind::HedgeRequested,
                    serde_json::json!({
                        "symbol": symbol,
                        "hedgePct": hedge_pct,
                        "qty": qty.to_string(),
                    }),
                ),
                ExposureEvent::SafeMode { key, entered } => (
                    if *entered {
                        EventKind::SafeModeEntered
                    } else {
                        EventKind::SafeModeCleared
                    },
                    serde_json::json!({
                        "symbol": key.symbol,
                        "scope": key.scope.to_string(),
                    }),
                ),
            };
            self.journal_or_uncertain(None, kind, payload);
        }
    }

    fn publish_order(&self, order_id: &str) {
        if let Some(order) = self.orders.get(order_id) {
            self.events.publish_order(order);
        }
    }

    fn publish_position(&self, position_id: &str) {
        if let Some(position) = self.positions.get(position_id) {
            self.events.publish_position(position);
        }
    }

    fn publish_exposure(&self, symbol: &str, account_id: &str) {
        use crate::exposure::{ExposureKey, Scope};
        let global = self.exposure.counters(&ExposureKey {
            symbol: symbol.to_string(),
            scope: Scope::Global,
            scope_id: None,
        });
        self.events
            .publish_exposure(symbol, "global", global.net, global.gross);
        let account = self.exposure.counters(&ExposureKey {
            symbol: symbol.to_string(),
            scope: Scope::Account,
            scope_id: Some(account_id.to_string()),
        });
        self.events
            .publish_exposure(symbol, "account", account.net, account.gross);
    }

    /// Periodic exposure reconciliation: recompute counters from the
    /// position book and journal any safe-mode changes.
    pub fn reconcile_exposure(&self) {
        let events = self.exposure.reconcile(&self.positions.open_positions());
        self.journal_exposure_events(&events);
        self.reconcile_uncertain_orders();
    }

    /// Orders flagged after a failed journal write get their current state
    /// re-journaled; a successful append resolves the flag.
    fn reconcile_uncertain_orders(&self) {
        for order in self.orders.uncertain_orders() {
            let record = serde_json::json!({
                "orderId": order.id,
                "state": order.state,
                "remaining": order.remaining.to_string(),
                "fills": order.fills.len(),
            });
            match self.journal.append(EventKind::OrderReconciled, record) {
                Ok(_) => {
                    self.orders.clear_uncertain(&order.id);
                    info!(order_id = %order.id, "uncertain order reconciled");
                }
                Err(e) => warn!(order_id = %order.id, error = %e, "uncertain order still unresolved"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // cancel / modify / close / preview
    // -------------------------------------------------------------------------

    pub async fn cancel_order(&self, order_id: &str) -> Result<OrderState, Rejection> {
        let order = self.orders.cancel(order_id)?;

        // Routed legs also cancel at the venue.
        if matches!(
            order.routing_path,
            Some(ExecutionPath::ABook) | Some(ExecutionPath::Hybrid)
        ) {
            for session in self.sessions.sessions() {
                if let Some(ack) = session.ack_for(&order.id) {
                    if let Err(rejection) = session.cancel(&ack.lp_order_id).await {
                        warn!(order_id = %order.id, lp = %ack.lp, reason = %rejection, "venue cancel failed");
                    }
                }
            }
        }

        self.journal_or_uncertain(
            Some(&order.id),
            EventKind::OrderCancelled,
            serde_json::json!({ "orderId": order.id }),
        );
        self.publish_order(&order.id);
        Ok(order.state)
    }

    pub async fn modify_order(
        &self,
        order_id: &str,
        new_sl: Option<Decimal>,
        new_tp: Option<Decimal>,
        new_limit_price: Option<Decimal>,
    ) -> Result<OrderState, Rejection> {
        let order = self
            .orders
            .modify(order_id, new_sl, new_tp, new_limit_price)?;
        self.journal_or_uncertain(
            Some(&order.id),
            EventKind::OrderModified,
            serde_json::json!({ "orderId": order.id }),
        );
        self.publish_order(&order.id);
        Ok(order.state)
    }

    /// Release an order parked by a `hold` routing rule: route it afresh
    /// and execute. A decision that would hold again falls through to the
    /// default path, so a manual release always makes progress.
    pub async fn release_order(&self, order_id: &str) -> Result<OrderState, Rejection> {
        let order = self
            .orders
            .get(order_id)
            .ok_or_else(|| Rejection::new(RejectReason::UnknownOrder))?;
        if order.state != OrderState::Pending {
            return Err(Rejection::new(RejectReason::InvalidOrder));
        }
        let instrument = self
            .registry
            .get(&order.symbol)
            .ok_or_else(|| Rejection::new(RejectReason::UnknownSymbol))?;

        let lock = self.account_lock(&order.account_id);
        let _guard = lock.lock().await;

        let (_, impact, _) = self.exposure.pre_trade(
            &order.symbol,
            &order.account_id,
            None,
            order.side,
            order.remaining,
            instrument.contract_size,
        );
        let profile = self.profiles.get(&order.account_id);
        let rules = self.rules();
        let lp_health = self.sessions.health_snapshot();
        let mut decision = router::decide(&router::RouteInputs {
            account_id: &order.account_id,
            client_order_id: &order.client_order_id,
            symbol: &order.symbol,
            side: order.side,
            qty: order.remaining,
            minute_of_day: minute_of_day(self.clock.now_ms()),
            profile: &profile,
            rules: rules.as_slice(),
            lp_health: &lp_health,
            impact,
            default_path: self.default_path,
            toxicity_cutoff: self.toxicity_cutoff,
        });
        if decision.path == RoutePath::Hold {
            decision.path = RoutePath::BBook;
            decision.lp_name = None;
        }

        if decision.path == RoutePath::Reject {
            let reason = decision
                .reject_reason
                .unwrap_or(RejectReason::RoutingRejected);
            let _ = self.orders.reject(&order.id, reason);
            self.journal_or_uncertain(
                Some(&order.id),
                EventKind::OrderRejected,
                serde_json::json!({ "orderId": order.id, "reason": reason }),
            );
            self.publish_order(&order.id);
            return Err(reason.into());
        }

        let path = match decision.path {
            RoutePath::ABook => ExecutionPath::ABook,
            RoutePath::Hybrid => ExecutionPath::Hybrid,
            _ => ExecutionPath::BBook,
        };
        let accepted = self.orders.accept(&order.id, path, None)?;
        self.journal_or_uncertain(
            Some(&accepted.id),
            EventKind::OrderAccepted,
            serde_json::json!({ "orderId": accepted.id, "released": true, "path": path }),
        );

        let snapshot = self.quotes.snapshot(&order.symbol);
        self.execute(
            &accepted,
            accepted.remaining,
            &decision,
            snapshot.as_ref(),
            &instrument,
        )
        .await;

        let current = self.orders.get(&accepted.id).unwrap_or(accepted);
        self.publish_order(&current.id);
        Ok(current.state)
    }

    /// Close (part of) a position with a synthesized opposite market order.
    pub async fn close_position(
        &self,
        position_id: &str,
        qty: Option<Decimal>,
    ) -> Result<PlaceOrderResponse, Rejection> {
        let position = self
            .positions
            .get(position_id)
            .filter(|p| p.is_open())
            .ok_or_else(|| Rejection::new(RejectReason::UnknownPosition))?;

        let close_qty = qty.unwrap_or_else(|| position.qty()).min(position.qty());
        if close_qty <= Decimal::ZERO {
            return Err(Rejection::new(RejectReason::InvalidOrder));
        }

        let close_side = match position.side {
            crate::types::PositionSide::Long => Side::Sell,
            crate::types::PositionSide::Short => Side::Buy,
        };

        let req = PlaceOrderRequest {
            account_id: position.account_id.clone(),
            client_order_id: format!("close-{}-{}", position_id, Uuid::new_v4()),
            symbol: position.symbol.clone(),
            side: close_side,
            kind: OrderKind::Market,
            qty: close_qty,
            limit_price: None,
            stop_price: None,
            tif: Tif::Ioc,
            good_till: None,
            sl: None,
            tp: None,
            trailing_distance: None,
            deadline_ms: None,
        };

        Ok(self
            .place(
                req,
                FillIntent::Close {
                    position_id: Some(position_id.to_string()),
                },
            )
            .await)
    }

    /// A protective exit became due: close the position at market.
    pub async fn execute_exit(&self, trigger: &ExitTrigger) {
        info!(
            position_id = %trigger.position_id,
            reason = %trigger.reason,
            ref_price = %trigger.ref_price,
            "protective exit firing"
        );
        self.positions
            .set_close_reason(&trigger.position_id, &trigger.reason.to_string());
        if let Err(rejection) = self
            .close_position(&trigger.position_id, Some(trigger.qty))
            .await
        {
            warn!(position_id = %trigger.position_id, reason = %rejection, "protective exit failed");
        }
    }

    /// Non-committing routing decision for a hypothetical order.
    pub fn preview_routing(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<RoutingDecision, Rejection> {
        let instrument = self
            .registry
            .get(symbol)
            .ok_or_else(|| Rejection::new(RejectReason::UnknownSymbol))?;
        let (_, impact, _) =
            self.exposure
                .pre_trade(symbol, account_id, None, side, qty, instrument.contract_size);
        let profile = self.profiles.get(account_id);
        let rules = self.rules();
        let lp_health = self.sessions.health_snapshot();
        Ok(router::decide(&router::RouteInputs {
            account_id,
            client_order_id: "preview",
            symbol,
            side,
            qty,
            minute_of_day: minute_of_day(self.clock.now_ms()),
            profile: &profile,
            rules: rules.as_slice(),
            lp_health: &lp_health,
            impact,
            default_path: self.default_path,
            toxicity_cutoff: self.toxicity_cutoff,
        }))
    }

    // -------------------------------------------------------------------------
    // Tick-driven work: resting orders and protective exits
    // -------------------------------------------------------------------------

    /// Wake resting orders whose trigger or limit condition the new best
    /// quote satisfies, and ratchet trailing stops.
    pub async fn on_tick(&self, symbol: &str, best: &BestQuote) {
        let resting: Vec<Order> = self
            .orders
            .open_orders()
            .into_iter()
            .filter(|o| o.symbol == symbol && o.state == OrderState::New)
            .collect();

        for order in resting {
            // Halted symbols keep their resting orders parked until the
            // breaker re-arms (through triggered and cooling).
            if self
                .breakers
                .suspends(&order.symbol, &order.account_id)
                .is_some()
            {
                continue;
            }

            // Trailing stops ratchet toward the market first.
            if order.kind == OrderKind::TrailingStop {
                if let (Some(stop), Some(distance)) = (order.stop_price, order.trailing_distance) {
                    let candidate = match order.side {
                        Side::Sell => best.bid - distance,
                        Side::Buy => best.ask + distance,
                    };
                    let tighter = match order.side {
                        Side::Sell => candidate > stop,
                        Side::Buy => candidate < stop,
                    };
                    if tighter {
                        let _ = self.orders.update_stop(&order.id, candidate);
                    }
                }
            }

            let Some(current) = self.orders.get(&order.id) else {
                continue;
            };
            if !is_marketable(&current, Some(best)) {
                continue;
            }

            let Some(instrument) = self.registry.get(symbol) else {
                continue;
            };
            let book_price = match current.side {
                Side::Buy => best.ask,
                Side::Sell => best.bid,
            };
            // Resting orders execute on the book when they wake; routed
            // external legs only happen at entry.
            let price = self.marked_up(book_price, current.side, &instrument);
            self.fill_internal(&current.id, current.remaining, price).await;
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rules", &self.rules.read().len())
            .field("idempotency", &self.idempotency.read().len())
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn validate(req: &PlaceOrderRequest) -> Option<Rejection> {
    if req.qty <= Decimal::ZERO {
        return Some(Rejection::with_detail(
            RejectReason::InvalidOrder,
            serde_json::json!({ "error": "qty must be positive" }),
        ));
    }
    if req.client_order_id.is_empty() || req.account_id.is_empty() {
        return Some(Rejection::new(RejectReason::InvalidOrder));
    }
    match req.kind {
        OrderKind::Limit if req.limit_price.is_none() => {
            Some(Rejection::with_detail(
                RejectReason::InvalidOrder,
                serde_json::json!({ "error": "limit order requires limitPrice" }),
            ))
        }
        OrderKind::Stop | OrderKind::TrailingStop if req.stop_price.is_none() => {
            Some(Rejection::with_detail(
                RejectReason::InvalidOrder,
                serde_json::json!({ "error": "stop order requires stopPrice" }),
            ))
        }
        OrderKind::StopLimit if req.stop_price.is_none() || req.limit_price.is_none() => {
            Some(Rejection::with_detail(
                RejectReason::InvalidOrder,
                serde_json::json!({ "error": "stop-limit order requires stopPrice and limitPrice" }),
            ))
        }
        _ => None,
    }
}

/// Price used for margin and notional checks.
fn reference_price(
    req: &PlaceOrderRequest,
    snapshot: Option<&BestQuote>,
) -> Result<Decimal, Rejection> {
    match req.kind {
        OrderKind::Market => match snapshot {
            Some(best) => Ok(match req.side {
                Side::Buy => best.ask,
                Side::Sell => best.bid,
            }),
            // A dead market refuses market orders outright.
            None => Err(Rejection::new(RejectReason::NoMarket)),
        },
        OrderKind::Limit => Ok(req.limit_price.expect("validated")),
        OrderKind::Stop | OrderKind::TrailingStop | OrderKind::StopLimit => {
            Ok(req.stop_price.expect("validated"))
        }
    }
}

/// Whether the order executes against the current book right now.
fn is_marketable(order: &Order, snapshot: Option<&BestQuote>) -> bool {
    let Some(best) = snapshot else { return false };
    match order.kind {
        OrderKind::Market => true,
        OrderKind::Limit => match (order.side, order.limit_price) {
            (Side::Buy, Some(limit)) => best.ask <= limit,
            (Side::Sell, Some(limit)) => best.bid >= limit,
            _ => false,
        },
        OrderKind::Stop | OrderKind::TrailingStop => match (order.side, order.stop_price) {
            (Side::Buy, Some(stop)) => best.ask >= stop,
            (Side::Sell, Some(stop)) => best.bid <= stop,
            _ => false,
        },
        OrderKind::StopLimit => {
            let triggered = match (order.side, order.stop_price) {
                (Side::Buy, Some(stop)) => best.ask >= stop,
                (Side::Sell, Some(stop)) => best.bid <= stop,
                _ => false,
            };
            let marketable_limit = match (order.side, order.limit_price) {
                (Side::Buy, Some(limit)) => best.ask <= limit,
                (Side::Sell, Some(limit)) => best.bid >= limit,
                _ => false,
            };
            triggered && marketable_limit
        }
    }
}

fn round_step(qty: Decimal) -> Decimal {
    if QTY_STEP.is_zero() {
        return qty;
    }
    (qty / QTY_STEP).floor() * QTY_STEP
}

fn minute_of_day(now_ms: u64) -> u32 {
    let dt = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    dt.hour() * 60 + dt.minute()
}

/// Canonical body hash for idempotency comparison. The deadline is
/// transport detail, not body.
fn hash_body(req: &PlaceOrderRequest) -> String {
    let canonical = serde_json::json!({
        "accountId": req.account_id,
        "clientOrderId": req.client_order_id,
        "symbol": req.symbol,
        "side": req.side,
        "kind": req.kind,
        "qty": req.qty.to_string(),
        "limitPrice": req.limit_price.map(|p| p.to_string()),
        "stopPrice": req.stop_price.map(|p| p.to_string()),
        "tif": req.tif,
        "goodTill": req.good_till,
        "sl": req.sl.map(|p| p.to_string()),
        "tp": req.tp.map(|p| p.to_string()),
        "trailingDistance": req.trailing_distance.map(|p| p.to_string()),
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::breakers::{Breaker, BreakerKind, BreakerScope, BreakerState};
    use crate::clock::ManualClock;
    use crate::exposure::{ExposureLimit, LimitAction, Scope};
    use crate::lp::{LpAdapter, LpEvent, LpSession, SimulatedLp};
    use crate::market_data::Quote;
    use crate::profile::ClientProfile;
    use crate::router::RuleAction;
    use crate::types::MarginMode;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    const NOW: u64 = 1_700_000_000_000;

    struct Fixture {
        clock: Arc<ManualClock>,
        quotes: Arc<QuoteBoard>,
        accounts: Arc<AccountBook>,
        profiles: Arc<ClientProfileStore>,
        sessions: Arc<SessionManager>,
        exposure: Arc<ExposureEngine>,
        breakers: Arc<BreakerPanel>,
        orders: Arc<OrderStore>,
        positions: Arc<PositionBook>,
        journal: Arc<Journal>,
        dispatcher: Dispatcher,
        lp_events: mpsc::Receiver<LpEvent>,
    }

    fn fixture(mode: MarginMode) -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let shared: SharedClock = clock.clone();

        let config = EngineConfig::default();
        let registry = Arc::new(InstrumentRegistry::with_fx_defaults(&config.symbols));
        let accounts = Arc::new(AccountBook::new());
        accounts.upsert(Account::new("A", dec!(100000), dec!(100)));
        let profiles = Arc::new(ClientProfileStore::new());
        let quotes = Arc::new(QuoteBoard::new(shared.clone(), config.quote_stale_ttl_ms));

        let sessions = Arc::new(SessionManager::new());
        let session = Arc::new(LpSession::new(
            "LP-X",
            config.symbols.clone(),
            LpAdapter::Simulated(
                SimulatedLp::new(shared.clone()).with_price_adjust(dec!(0.00001)),
            ),
            config.heartbeat_misses,
            sessions.events_sender(),
            shared.clone(),
        ));
        session.mark_connected();
        session.mark_streaming();
        sessions.add_session(session);
        let lp_events = sessions.take_events();

        let exposure = Arc::new(ExposureEngine::new(dec!(0.01)));
        let breakers = Arc::new(BreakerPanel::new(shared.clone()));
        let orders = Arc::new(OrderStore::new(shared.clone()));
        let positions = Arc::new(PositionBook::new(mode, shared.clone()));
        let journal = Arc::new(Journal::in_memory(shared.clone()));
        let events = Arc::new(EventHub::new());
        let risk = Arc::new(RiskEngine::new(
            accounts.clone(),
            positions.clone(),
            breakers.clone(),
            config.max_open_positions_per_account,
            config.daily_loss_limit,
        ));

        let dispatcher = Dispatcher::new(
            &config,
            shared,
            registry,
            accounts.clone(),
            profiles.clone(),
            quotes.clone(),
            sessions.clone(),
            exposure.clone(),
            risk,
            breakers.clone(),
            orders.clone(),
            positions.clone(),
            journal.clone(),
            events,
        );

        Fixture {
            clock,
            quotes,
            accounts,
            profiles,
            sessions,
            exposure,
            breakers,
            orders,
            positions,
            journal,
            dispatcher,
            lp_events,
        }
    }

    fn seed_quote(f: &Fixture, bid: &str, ask: &str, seq: u64) {
        f.quotes.publish(Quote {
            symbol: "EURUSD".to_string(),
            bid: bid.parse().unwrap(),
            ask: ask.parse().unwrap(),
            bid_size: dec!(1000000),
            ask_size: dec!(1000000),
            lp: "LP-X".to_string(),
            seq,
            ts: f.clock.now_ms(),
        });
    }

    fn market_buy(cid: &str, qty: Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest {
            account_id: "A".to_string(),
            client_order_id: cid.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            kind: OrderKind::Market,
            qty,
            limit_price: None,
            stop_price: None,
            tif: Tif::Gtc,
            good_till: None,
            sl: None,
            tp: None,
            trailing_distance: None,
            deadline_ms: None,
        }
    }

    /// Pump every queued LP event through the dispatcher, as the engine
    /// event loop does in production.
    async fn drain_lp_events(f: &mut Fixture) {
        while let Ok(event) = f.lp_events.try_recv() {
            if let LpEvent::Fill(fill) = event {
                f.dispatcher.apply_external_fill(fill).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // End-to-end scenarios
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn market_buy_bbook_full_fill() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;

        assert_eq!(resp.state, Some(OrderState::Filled));
        assert_eq!(resp.fills.len(), 1);
        assert_eq!(resp.fills[0].price, dec!(1.10020));
        assert_eq!(resp.routing.as_ref().unwrap().path, RoutePath::BBook);

        let positions = f.positions.positions_for_account("A");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty(), dec!(1));
        assert_eq!(positions[0].avg_entry(), dec!(1.10020));

        // Net long exposure grew by one contract.
        let key = crate::exposure::ExposureKey {
            symbol: "EURUSD".to_string(),
            scope: Scope::Global,
            scope_id: None,
        };
        assert_eq!(f.exposure.counters(&key).net, dec!(100000));

        f.journal.verify_chain().unwrap();
    }

    #[tokio::test]
    async fn market_buy_abook_routed_via_rule() {
        let mut f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        f.dispatcher.set_rules(vec![RoutingRule {
            name: "big-flow-out".to_string(),
            priority: 1,
            active: true,
            symbols: None,
            accounts: None,
            min_qty: Some(dec!(1)),
            max_qty: None,
            window: None,
            max_utilization_pct: None,
            min_utilization_pct: None,
            min_toxicity: None,
            max_toxicity: None,
            action: RuleAction::ABook,
            target_lp: Some("LP-X".to_string()),
            hedge_pct: None,
        }]);

        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        let routing = resp.routing.as_ref().unwrap();
        assert_eq!(routing.path, RoutePath::ABook);
        assert_eq!(routing.lp_name.as_deref(), Some("LP-X"));
        // The venue fill arrives through the event channel.
        assert_eq!(resp.state, Some(OrderState::New));

        drain_lp_events(&mut f).await;

        let order = f.orders.get(resp.order_id.as_ref().unwrap()).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        // Simulated venue fills at ask + 0.00001.
        assert_eq!(order.fills[0].price, dec!(1.10021));

        let positions = f.positions.positions_for_account("A");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].avg_entry(), dec!(1.10021));

        let key = crate::exposure::ExposureKey {
            symbol: "EURUSD".to_string(),
            scope: Scope::Global,
            scope_id: None,
        };
        assert_eq!(f.exposure.counters(&key).net, dec!(100000));
    }

    #[tokio::test]
    async fn stop_loss_closes_position_at_bid() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        let mut req = market_buy("c1", dec!(1));
        req.sl = Some(dec!(1.09900));
        let resp = f.dispatcher.place_order(req).await;
        assert_eq!(resp.state, Some(OrderState::Filled));

        // The protective level rides on the opened position.
        let position = f.positions.positions_for_account("A")[0].clone();
        assert_eq!(position.sl, Some(dec!(1.09900)));

        // A tick through the stop fires a synthetic close at the bid.
        let triggers = f
            .positions
            .check_exits("EURUSD", dec!(1.09899), dec!(1.09919));
        assert_eq!(triggers.len(), 1);
        seed_quote(&f, "1.09899", "1.09919", 2);
        f.dispatcher.execute_exit(&triggers[0]).await;

        assert!(f.positions.positions_for_account("A").is_empty());
        let closed = f.positions.get(&position.id).unwrap();
        assert_eq!(closed.realized_pnl, dec!(-121.00000));
        assert_eq!(closed.close_reason.as_deref(), Some("SL"));

        // Exposure unwound.
        let key = crate::exposure::ExposureKey {
            symbol: "EURUSD".to_string(),
            scope: Scope::Global,
            scope_id: None,
        };
        assert_eq!(f.exposure.counters(&key).net, Decimal::ZERO);

        // The account absorbed the loss.
        let account = f.accounts.get("A").unwrap();
        assert_eq!(account.balance, dec!(100000) + dec!(-121.00000));
    }

    #[tokio::test]
    async fn exposure_hedge_action_goes_hybrid() {
        let mut f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        f.exposure.set_limits(vec![ExposureLimit {
            symbol: "EURUSD".to_string(),
            scope: Scope::Global,
            scope_id: None,
            max_net: dec!(100000),
            max_gross: dec!(10000000),
            warn_pct: 90,
            action: LimitAction::Hedge,
            hedge_pct: 50,
        }]);

        // Fill the book to the cap first.
        f.dispatcher.place_order(market_buy("c0", dec!(1))).await;

        // The next buy breaches; it must go out hybrid at 50%.
        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        let routing = resp.routing.as_ref().unwrap();
        assert_eq!(routing.path, RoutePath::Hybrid);
        assert_eq!(routing.hedge_pct, Some(50));
        assert_eq!(routing.lp_name.as_deref(), Some("LP-X"));

        drain_lp_events(&mut f).await;
        let order = f.orders.get(resp.order_id.as_ref().unwrap()).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        // Two fills: the internal leg and the venue leg.
        assert_eq!(order.fills.len(), 2);
        let total: Decimal = order.fills.iter().map(|fl| fl.qty).sum();
        assert_eq!(total, dec!(1));

        // A hedge request was journaled.
        let hedge_events: Vec<_> = f
            .journal
            .read_from(1)
            .into_iter()
            .filter(|e| e.kind == EventKind::HedgeRequested)
            .collect();
        assert!(!hedge_events.is_empty());
    }

    #[tokio::test]
    async fn tripped_breaker_rejects_market_order() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        f.breakers.install(Breaker {
            name: "eurusd-3pct".to_string(),
            kind: BreakerKind::PriceMovement,
            scope: BreakerScope::Symbol("EURUSD".to_string()),
            threshold: dec!(3),
            state: BreakerState::Armed,
            cooldown_ms: 60_000,
            triggered_at: None,
            cooling_since: None,
        });
        f.breakers.on_price("EURUSD", dec!(1.10010));
        f.breakers.on_price("EURUSD", dec!(1.14));

        // A resting limit order placed before the trip stays alive...
        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        assert_eq!(resp.state, Some(OrderState::Rejected));
        assert_eq!(
            resp.rejection.as_ref().unwrap().reason,
            RejectReason::BreakerTripped
        );
    }

    #[tokio::test]
    async fn duplicate_client_order_id_idempotent() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        let first = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        let second = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;

        // One order, identical responses.
        assert_eq!(first.order_id, second.order_id);
        assert_eq!(first.state, second.state);
        assert_eq!(f.positions.positions_for_account("A").len(), 1);

        // Same key with a different body is refused.
        let third = f.dispatcher.place_order(market_buy("c1", dec!(2))).await;
        assert_eq!(
            third.rejection.unwrap().reason,
            RejectReason::DuplicateClientOrderId
        );
    }

    // -------------------------------------------------------------------------
    // Behavior details
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn market_order_without_market_rejected() {
        let f = fixture(MarginMode::Hedging);
        // No quotes at all.
        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        assert_eq!(resp.rejection.unwrap().reason, RejectReason::NoMarket);
    }

    #[tokio::test]
    async fn stale_market_rejects_market_orders() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        f.clock.advance(10_000); // past the stale TTL
        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        assert_eq!(resp.rejection.unwrap().reason, RejectReason::NoMarket);
    }

    #[tokio::test]
    async fn unknown_symbol_rejected() {
        let f = fixture(MarginMode::Hedging);
        let mut req = market_buy("c1", dec!(1));
        req.symbol = "XAUUSD".to_string();
        let resp = f.dispatcher.place_order(req).await;
        assert_eq!(resp.rejection.unwrap().reason, RejectReason::UnknownSymbol);
    }

    #[tokio::test]
    async fn limit_order_rests_until_marketable() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        let mut req = market_buy("c1", dec!(1));
        req.kind = OrderKind::Limit;
        req.limit_price = Some(dec!(1.09950));
        let resp = f.dispatcher.place_order(req).await;
        assert_eq!(resp.state, Some(OrderState::New));
        assert!(resp.fills.is_empty());

        // The market comes down to the limit.
        seed_quote(&f, "1.09900", "1.09940", 2);
        let best = f.quotes.snapshot("EURUSD").unwrap();
        f.dispatcher.on_tick("EURUSD", &best).await;

        let order = f.orders.get(resp.order_id.as_ref().unwrap()).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.fills[0].price, dec!(1.09940));
    }

    #[tokio::test]
    async fn ioc_limit_cancels_when_not_marketable() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        let mut req = market_buy("c1", dec!(1));
        req.kind = OrderKind::Limit;
        req.limit_price = Some(dec!(1.09000));
        req.tif = Tif::Ioc;
        let resp = f.dispatcher.place_order(req).await;
        assert_eq!(resp.state, Some(OrderState::Cancelled));
    }

    #[tokio::test]
    async fn expired_deadline_times_out() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        let mut req = market_buy("c1", dec!(1));
        req.deadline_ms = Some(NOW - 1);
        let resp = f.dispatcher.place_order(req).await;
        assert_eq!(resp.rejection.unwrap().reason, RejectReason::Timeout);
    }

    #[tokio::test]
    async fn close_position_round_trip() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);

        f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        let position = f.positions.positions_for_account("A")[0].clone();

        seed_quote(&f, "1.10120", "1.10140", 2);
        let resp = f
            .dispatcher
            .close_position(&position.id, None)
            .await
            .unwrap();
        assert_eq!(resp.state, Some(OrderState::Filled));
        assert!(f.positions.positions_for_account("A").is_empty());

        // Sold at the new bid: (1.10120 - 1.10020) x 100000.
        let closed = f.positions.get(&position.id).unwrap();
        assert_eq!(closed.realized_pnl, dec!(100.00000));
    }

    #[tokio::test]
    async fn close_unknown_position_rejected() {
        let f = fixture(MarginMode::Hedging);
        let err = f.dispatcher.close_position("missing", None).await.unwrap_err();
        assert_eq!(err.reason, RejectReason::UnknownPosition);
    }

    #[tokio::test]
    async fn toxic_profile_routes_out_by_default() {
        let mut f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        f.profiles.upsert(ClientProfile {
            account_id: "A".to_string(),
            toxicity_score: 90,
            a_book_pct: 0,
            b_book_pct: 100,
            manual_override: None,
        });

        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        assert_eq!(resp.routing.as_ref().unwrap().path, RoutePath::ABook);
        drain_lp_events(&mut f).await;
        let order = f.orders.get(resp.order_id.as_ref().unwrap()).unwrap();
        assert_eq!(order.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn preview_routing_commits_nothing() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        let decision = f
            .dispatcher
            .preview_routing("A", "EURUSD", Side::Buy, dec!(1))
            .unwrap();
        assert_eq!(decision.path, RoutePath::BBook);
        assert!(f.orders.open_orders().is_empty());
        assert!(f.positions.positions_for_account("A").is_empty());
    }

    #[tokio::test]
    async fn remaining_plus_fills_equals_qty_always() {
        let mut f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        f.exposure.set_limits(vec![ExposureLimit {
            symbol: "EURUSD".to_string(),
            scope: Scope::Global,
            scope_id: None,
            max_net: dec!(10000000),
            max_gross: dec!(10000000),
            warn_pct: 50,
            action: LimitAction::Hedge,
            hedge_pct: 30,
        }]);

        for (i, qty) in [dec!(1), dec!(0.37), dec!(2.5)].iter().enumerate() {
            let resp = f
                .dispatcher
                .place_order(market_buy(&format!("c{i}"), *qty))
                .await;
            drain_lp_events(&mut f).await;
            let order = f.orders.get(resp.order_id.as_ref().unwrap()).unwrap();
            assert_eq!(order.remaining + order.filled_qty(), order.qty);
        }
    }

    #[tokio::test]
    async fn journal_chain_survives_busy_flow() {
        let mut f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        for i in 0..5 {
            f.dispatcher
                .place_order(market_buy(&format!("c{i}"), dec!(0.5)))
                .await;
        }
        drain_lp_events(&mut f).await;
        f.journal.verify_chain().unwrap();
        assert!(f.journal.last_seq() > 0);
    }

    #[tokio::test]
    async fn equity_equals_balance_plus_unrealized() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        f.dispatcher.place_order(market_buy("c1", dec!(1))).await;

        // Marks move, account figures follow.
        seed_quote(&f, "1.10150", "1.10170", 2);
        f.positions.mark("EURUSD", dec!(1.10150), dec!(1.10170));
        f.dispatcher.refresh_account_marks("A");

        let account = f.accounts.get("A").unwrap();
        let unrealized = f.positions.unrealized_for_account("A");
        assert_eq!(unrealized, dec!(130.00000)); // (1.10150 - 1.10020) x 100000
        assert_eq!(account.equity, account.balance + unrealized);
        assert!(account.margin_used > Decimal::ZERO);
        assert_eq!(
            account.margin_available,
            account.equity + account.credit - account.margin_used
        );
    }

    #[tokio::test]
    async fn held_order_releases_and_executes() {
        let f = fixture(MarginMode::Hedging);
        seed_quote(&f, "1.10000", "1.10020", 1);
        f.dispatcher.set_rules(vec![RoutingRule {
            name: "park-everything".to_string(),
            priority: 1,
            active: true,
            symbols: None,
            accounts: None,
            min_qty: None,
            max_qty: None,
            window: None,
            max_utilization_pct: None,
            min_utilization_pct: None,
            min_toxicity: None,
            max_toxicity: None,
            action: RuleAction::Hold,
            target_lp: None,
            hedge_pct: None,
        }]);

        let resp = f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        assert_eq!(resp.state, Some(OrderState::Pending));
        assert_eq!(resp.routing.as_ref().unwrap().path, RoutePath::Hold);
        assert!(f.positions.positions_for_account("A").is_empty());

        // Manual release: the hold rule would match again, so release falls
        // back to internalization and executes.
        let state = f
            .dispatcher
            .release_order(resp.order_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(state, OrderState::Filled);
        assert_eq!(f.positions.positions_for_account("A").len(), 1);
    }

    #[tokio::test]
    async fn netting_buy_then_sell_flat_book() {
        let f = fixture(MarginMode::Netting);
        seed_quote(&f, "1.10000", "1.10020", 1);

        f.dispatcher.place_order(market_buy("c1", dec!(1))).await;
        let mut sell = market_buy("c2", dec!(1));
        sell.side = Side::Sell;
        seed_quote(&f, "1.10120", "1.10140", 2);
        f.dispatcher.place_order(sell).await;

        // Net position is flat, realized equals the bid-ask round trip.
        assert!(f.positions.positions_for_account("A").is_empty());
        let account = f.accounts.get("A").unwrap();
        assert_eq!(account.balance, dec!(100000) + dec!(100.00000));
    }
}
