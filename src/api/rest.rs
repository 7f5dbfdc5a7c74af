// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid bearer token. Rejections come back as machine-readable
// reason kinds with optional structured detail, never free text.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::AuthBearer;
use crate::app_state::EngineState;
use crate::dispatcher::{Dispatcher, PlaceOrderRequest};
use crate::types::{RejectReason, Rejection, Side};

/// Shared handler context.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<EngineState>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(context: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Commands ────────────────────────────────────────────────
        .route("/api/v1/orders", post(place_order).get(orders))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/modify", post(modify_order))
        .route("/api/v1/orders/:id/release", post(release_order))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/routing/preview", post(preview_routing))
        // ── Reads ───────────────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/orders/:id", get(order_by_id))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/exposure", get(exposure))
        .route("/api/v1/quotes/:symbol", get(quotes))
        .route("/api/v1/lps", get(lp_health))
        .route("/api/v1/journal/verify", get(verify_journal))
        // ── Admin reference data ────────────────────────────────────
        .route("/api/v1/accounts", post(register_account))
        .route("/api/v1/profiles", post(upsert_profile))
        .route("/api/v1/rules", get(get_rules).post(set_rules))
        .route("/api/v1/limits", get(get_limits).post(set_limits))
        .route("/api/v1/instruments", get(get_instruments).post(reload_instruments))
        // ── Breaker control ─────────────────────────────────────────
        .route("/api/v1/breakers", get(breakers).post(install_breaker))
        .route("/api/v1/breakers/:name/trip", post(trip_breaker))
        .route("/api/v1/breakers/:name/reset", post(reset_breaker))
        // ── WebSocket streams ───────────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(context)
}

/// Transport code for each rejection kind.
fn status_for(reason: RejectReason) -> StatusCode {
    use RejectReason::*;
    match reason {
        UnknownSymbol | UnknownOrder | UnknownPosition => StatusCode::NOT_FOUND,
        DuplicateClientOrderId => StatusCode::CONFLICT,
        InvalidOrder => StatusCode::UNPROCESSABLE_ENTITY,
        AccountInactive | SymbolUntradable | BreakerTripped | MarginInsufficient
        | LeverageExceeded | PositionLimitExceeded | DailyLossLimitExceeded
        | RoutingRejected | ExposureBreach => StatusCode::UNPROCESSABLE_ENTITY,
        NoRouteAvailable | NoMarket | LpUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        Timeout => StatusCode::GATEWAY_TIMEOUT,
        BackpressureShed => StatusCode::TOO_MANY_REQUESTS,
        JournalError | InconsistentState => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection_response(rejection: &Rejection) -> axum::response::Response {
    (status_for(rejection.reason), Json(serde_json::json!(rejection))).into_response()
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "stateVersion": ctx.state.current_state_version(),
        "journalSeq": ctx.state.journal.last_seq(),
        "serverTime": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Commands
// =============================================================================

async fn place_order(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(req): Json<PlaceOrderRequest>,
) -> impl IntoResponse {
    info!(
        account_id = %req.account_id,
        client_order_id = %req.client_order_id,
        symbol = %req.symbol,
        side = %req.side,
        qty = %req.qty,
        "place order received"
    );
    let response = ctx.dispatcher.place_order(req).await;
    ctx.state.increment_version();
    match &response.rejection {
        Some(rejection) => {
            (status_for(rejection.reason), Json(serde_json::json!(response))).into_response()
        }
        None => Json(serde_json::json!(response)).into_response(),
    }
}

async fn cancel_order(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match ctx.dispatcher.cancel_order(&order_id).await {
        Ok(state) => {
            ctx.state.increment_version();
            Json(serde_json::json!({ "state": state })).into_response()
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModifyOrderBody {
    new_sl: Option<Decimal>,
    new_tp: Option<Decimal>,
    new_limit_price: Option<Decimal>,
}

async fn modify_order(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(order_id): Path<String>,
    Json(body): Json<ModifyOrderBody>,
) -> impl IntoResponse {
    match ctx
        .dispatcher
        .modify_order(&order_id, body.new_sl, body.new_tp, body.new_limit_price)
        .await
    {
        Ok(state) => {
            ctx.state.increment_version();
            Json(serde_json::json!({ "state": state })).into_response()
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

async fn release_order(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match ctx.dispatcher.release_order(&order_id).await {
        Ok(state) => {
            ctx.state.increment_version();
            Json(serde_json::json!({ "state": state })).into_response()
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseBody {
    qty: Option<Decimal>,
}

async fn close_position(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(position_id): Path<String>,
    Json(body): Json<CloseBody>,
) -> impl IntoResponse {
    match ctx.dispatcher.close_position(&position_id, body.qty).await {
        Ok(response) => {
            ctx.state.increment_version();
            Json(serde_json::json!(response)).into_response()
        }
        Err(rejection) => rejection_response(&rejection),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewBody {
    account_id: String,
    symbol: String,
    side: Side,
    qty: Decimal,
}

async fn preview_routing(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(body): Json<PreviewBody>,
) -> impl IntoResponse {
    match ctx
        .dispatcher
        .preview_routing(&body.account_id, &body.symbol, body.side, body.qty)
    {
        Ok(decision) => Json(serde_json::json!(decision)).into_response(),
        Err(rejection) => rejection_response(&rejection),
    }
}

// =============================================================================
// Reads
// =============================================================================

async fn full_state(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersQuery {
    account: Option<String>,
    client_order_id: Option<String>,
}

async fn orders(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Query(query): Query<OrdersQuery>,
) -> impl IntoResponse {
    match (query.account, query.client_order_id) {
        (Some(account), Some(client_order_id)) => {
            match ctx.state.orders.get_by_client(&account, &client_order_id) {
                Some(order) => Json(serde_json::json!(order)).into_response(),
                None => rejection_response(&Rejection::new(RejectReason::UnknownOrder)),
            }
        }
        (Some(account), None) => {
            Json(serde_json::json!(ctx.state.orders.orders_for_account(&account)))
                .into_response()
        }
        _ => Json(serde_json::json!(ctx.state.orders.open_orders())).into_response(),
    }
}

#[derive(Deserialize)]
struct PositionsQuery {
    account: Option<String>,
    status: Option<String>,
}

async fn positions(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Query(query): Query<PositionsQuery>,
) -> impl IntoResponse {
    if query.status.as_deref() == Some("closed") {
        return Json(ctx.state.positions.closed_positions(500)).into_response();
    }
    let positions = match query.account {
        Some(account) => ctx.state.positions.positions_for_account(&account),
        None => ctx.state.positions.open_positions(),
    };
    Json(positions).into_response()
}

async fn exposure(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    let entries: Vec<serde_json::Value> = ctx
        .state
        .exposure
        .snapshot()
        .into_iter()
        .map(|(key, counters)| {
            serde_json::json!({
                "symbol": key.symbol,
                "scope": key.scope.to_string(),
                "scopeId": key.scope_id,
                "net": counters.net,
                "gross": counters.gross,
            })
        })
        .collect();
    Json(entries)
}

async fn lp_health(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.sessions.health_snapshot())
}

async fn order_by_id(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    match ctx.state.orders.get(&order_id) {
        Some(order) => Json(serde_json::json!(order)).into_response(),
        None => rejection_response(&Rejection::new(RejectReason::UnknownOrder)),
    }
}

#[derive(Deserialize)]
struct QuotesQuery {
    history: Option<usize>,
}

async fn quotes(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(symbol): Path<String>,
    Query(query): Query<QuotesQuery>,
) -> impl IntoResponse {
    let snapshot = ctx.state.quotes.snapshot(&symbol);
    let history = query
        .history
        .map(|n| ctx.state.quotes.history(&symbol, n.min(4096)))
        .unwrap_or_default();
    Json(serde_json::json!({
        "symbol": symbol,
        "stale": snapshot.is_none(),
        "best": snapshot,
        "lastKnown": ctx.state.quotes.last_known(&symbol),
        "history": history,
    }))
}

async fn verify_journal(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    match ctx.state.journal.verify_chain() {
        Ok(()) => Json(serde_json::json!({
            "ok": true,
            "lastSeq": ctx.state.journal.last_seq(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

// =============================================================================
// Admin reference data
// =============================================================================

async fn register_account(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(account): Json<crate::accounts::Account>,
) -> impl IntoResponse {
    ctx.state.accounts.upsert(account);
    ctx.state.increment_version();
    StatusCode::NO_CONTENT
}

async fn upsert_profile(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(profile): Json<crate::profile::ClientProfile>,
) -> impl IntoResponse {
    if ctx.state.profiles.upsert(profile) {
        ctx.state.increment_version();
        StatusCode::NO_CONTENT.into_response()
    } else {
        rejection_response(&Rejection::with_detail(
            RejectReason::InvalidOrder,
            serde_json::json!({ "error": "profile percentages must sum to 100" }),
        ))
    }
}

async fn get_rules(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.dispatcher.rules().as_ref().clone())
}

async fn set_rules(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(rules): Json<Vec<crate::router::RoutingRule>>,
) -> impl IntoResponse {
    ctx.dispatcher.set_rules(rules);
    ctx.state.increment_version();
    StatusCode::NO_CONTENT
}

async fn get_limits(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.exposure.limits())
}

async fn set_limits(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(limits): Json<Vec<crate::exposure::ExposureLimit>>,
) -> impl IntoResponse {
    ctx.state.exposure.set_limits(limits);
    ctx.state.increment_version();
    StatusCode::NO_CONTENT
}

async fn get_instruments(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    let all = ctx.state.registry.all();
    let mut instruments: Vec<_> = all.values().cloned().collect();
    instruments.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Json(instruments)
}

async fn reload_instruments(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(instruments): Json<Vec<crate::instruments::Instrument>>,
) -> impl IntoResponse {
    ctx.state.registry.reload(instruments);
    ctx.state.increment_version();
    StatusCode::NO_CONTENT
}

async fn install_breaker(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Json(breaker): Json<crate::breakers::Breaker>,
) -> impl IntoResponse {
    ctx.state.breakers.install(breaker);
    ctx.state.increment_version();
    StatusCode::NO_CONTENT
}

// =============================================================================
// Breaker control
// =============================================================================

async fn breakers(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.breakers.all())
}

async fn trip_breaker(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.state.breakers.trip_manual(&name) {
        Some(transition) => {
            let _ = ctx.state.journal.append(
                crate::journal::EventKind::BreakerTransition,
                serde_json::json!({ "name": transition.name, "from": transition.from, "to": transition.to, "manual": true }),
            );
            ctx.state.increment_version();
            Json(serde_json::json!(transition)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn reset_breaker(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match ctx.state.breakers.reset_manual(&name) {
        Some(transition) => {
            let _ = ctx.state.journal.append(
                crate::journal::EventKind::BreakerTransition,
                serde_json::json!({ "name": transition.name, "from": transition.from, "to": transition.to, "manual": true }),
            );
            ctx.state.increment_version();
            Json(serde_json::json!(transition)).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
