// =============================================================================
// WebSocket Streams — quotes, orders, positions, exposure
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and subscribe per key:
//
//   {"subscribe":"quotes","symbol":"EURUSD"}
//   {"subscribe":"orders","account":"A","resumeFrom":42}
//   {"subscribe":"positions","account":"A","resumeFrom":0}
//   {"subscribe":"exposure","symbol":"EURUSD"}
//
// Quote streams are lossy: a slow client skips intermediate quotes. Order,
// position, and exposure streams are authoritative and sequenced; passing
// `resumeFrom` replays buffered events after that sequence before going
// live.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::ApiContext;
use crate::events::EngineEvent;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// One client->server control message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeMessage {
    subscribe: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    resume_from: Option<u64>,
}

#[derive(Debug, Default)]
struct Subscriptions {
    order_accounts: HashSet<String>,
    position_accounts: HashSet<String>,
    exposure_symbols: HashSet<String>,
}

impl Subscriptions {
    /// Whether a hub event falls under any active subscription.
    fn wants(&self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::OrderUpdate { account_id, .. } => {
                self.order_accounts.contains(account_id)
            }
            EngineEvent::PositionUpdate { account_id, .. } => {
                self.position_accounts.contains(account_id)
            }
            EngineEvent::ExposureUpdate { symbol, .. } => {
                self.exposure_symbols.contains(symbol)
            }
        }
    }
}

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
        .into_response()
}

async fn handle_connection(socket: WebSocket, ctx: ApiContext) {
    let (mut sender, mut receiver) = socket.split();

    let mut subs = Subscriptions::default();
    let mut hub_rx = ctx.state.events.subscribe();

    // Quote forwarders push into this bounded channel; overflow drops the
    // quote, never the publisher.
    let (quote_tx, mut quote_rx) = mpsc::channel::<serde_json::Value>(256);
    let mut quote_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            // ── Client control messages ─────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SubscribeMessage>(&text) {
                            Ok(sub) => {
                                handle_subscribe(&ctx, &mut subs, &sub, &quote_tx, &mut quote_tasks, &mut sender).await;
                            }
                            Err(e) => {
                                debug!(error = %e, "unparseable ws message ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sender.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "ws receive error");
                        break;
                    }
                }
            }

            // ── Authoritative engine events ─────────────────────────
            event = hub_rx.recv() => {
                match event {
                    Ok(event) if subs.wants(&event) => {
                        let out = serde_json::json!({ "stream": stream_name(&event), "data": event });
                        if sender.send(Message::Text(out.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // The client can resynchronize with resumeFrom.
                        let out = serde_json::json!({ "stream": "gap", "skipped": skipped });
                        if sender.send(Message::Text(out.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            // ── Lossy quote fan-out ─────────────────────────────────
            quote = quote_rx.recv() => {
                match quote {
                    Some(out) => {
                        if sender.send(Message::Text(out.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for task in quote_tasks {
        task.abort();
    }
    info!("WebSocket connection closed");
}

async fn handle_subscribe(
    ctx: &ApiContext,
    subs: &mut Subscriptions,
    sub: &SubscribeMessage,
    quote_tx: &mpsc::Sender<serde_json::Value>,
    quote_tasks: &mut Vec<tokio::task::JoinHandle<()>>,
    sender: &mut (impl SinkExt<Message> + Unpin),
) {
    match sub.subscribe.as_str() {
        "quotes" => {
            let Some(symbol) = sub.symbol.clone() else { return };
            let mut rx = ctx.state.quotes.subscribe(&symbol);
            let tx = quote_tx.clone();
            quote_tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(best) => {
                            let out = serde_json::json!({ "stream": "quotes", "data": best });
                            // Drop on backpressure rather than block.
                            let _ = tx.try_send(out);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
            }));
            debug!(symbol, "quote subscription added");
        }
        "orders" | "positions" => {
            let Some(account) = sub.account.clone() else { return };
            if sub.subscribe == "orders" {
                subs.order_accounts.insert(account.clone());
            } else {
                subs.position_accounts.insert(account.clone());
            }
            // Replay buffered events past the client's last seen sequence.
            if let Some(resume_from) = sub.resume_from {
                let replay = ctx.state.events.replay_after(resume_from);
                for event in replay {
                    let matches = match (&event, sub.subscribe.as_str()) {
                        (EngineEvent::OrderUpdate { account_id, .. }, "orders") => {
                            account_id == &account
                        }
                        (EngineEvent::PositionUpdate { account_id, .. }, "positions") => {
                            account_id == &account
                        }
                        _ => false,
                    };
                    if matches {
                        let out =
                            serde_json::json!({ "stream": stream_name(&event), "data": event });
                        let _ = sender.send(Message::Text(out.to_string())).await;
                    }
                }
            }
            debug!(account, kind = %sub.subscribe, "stream subscription added");
        }
        "exposure" => {
            if let Some(symbol) = sub.symbol.clone() {
                subs.exposure_symbols.insert(symbol);
            }
        }
        other => {
            debug!(kind = other, "unknown subscription ignored");
        }
    }
}

fn stream_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::OrderUpdate { .. } => "orders",
        EngineEvent::PositionUpdate { .. } => "positions",
        EngineEvent::ExposureUpdate { .. } => "exposure",
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_message_parses() {
        let msg: SubscribeMessage =
            serde_json::from_str(r#"{"subscribe":"orders","account":"A","resumeFrom":42}"#)
                .unwrap();
        assert_eq!(msg.subscribe, "orders");
        assert_eq!(msg.account.as_deref(), Some("A"));
        assert_eq!(msg.resume_from, Some(42));
    }

    #[test]
    fn subscriptions_filter_events() {
        use crate::oms::{Order, OrderStore};
        use crate::clock::ManualClock;
        use rust_decimal_macros::dec;
        let store = OrderStore::new(std::sync::Arc::new(ManualClock::new(0)));
        let order: Order = store.create(crate::oms::NewOrder {
            account_id: "A".to_string(),
            client_order_id: "c1".to_string(),
            symbol: "EURUSD".to_string(),
            side: crate::types::Side::Buy,
            kind: crate::types::OrderKind::Market,
            qty: dec!(1),
            limit_price: None,
            stop_price: None,
            tif: crate::types::Tif::Gtc,
            good_till: None,
            sl: None,
            tp: None,
            trailing_distance: None,
            close_position_id: None,
        });

        let mut subs = Subscriptions::default();
        let event = EngineEvent::OrderUpdate {
            seq: 1,
            account_id: "A".to_string(),
            order,
        };
        assert!(!subs.wants(&event));
        subs.order_accounts.insert("A".to_string());
        assert!(subs.wants(&event));
    }
}
