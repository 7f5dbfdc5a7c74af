// =============================================================================
// LP Adapters — venue-specific wire translation
// =============================================================================
//
// An adapter owns the actual conversation with one venue. Two adapters exist:
// a deterministic simulated venue (demo mode and tests) and an HMAC-signed
// REST venue. Sessions talk to adapters through the `LpAdapter` enum so the
// session logic stays identical across venues.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, warn};

use super::{LpFill, SubmitRequest};
use crate::clock::{Clock, SharedClock};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// What a venue said about a submit or cancel.
#[derive(Debug, Clone)]
pub enum AdapterResponse {
    /// Accepted. The simulated venue fills immediately; REST venues fill
    /// through their event feed.
    Ack {
        lp_order_id: String,
        fill: Option<LpFill>,
    },
    Reject {
        reason: String,
    },
}

/// Venue dispatch without trait objects; sessions hold one of these.
pub enum LpAdapter {
    Simulated(SimulatedLp),
    Rest(SignedRestLp),
}

impl LpAdapter {
    pub async fn submit(&self, lp: &str, req: &SubmitRequest) -> AdapterResponse {
        match self {
            Self::Simulated(sim) => sim.submit(lp, req),
            Self::Rest(rest) => rest.submit(req).await.unwrap_or_else(|e| {
                warn!(lp, error = %e, "REST submit failed");
                AdapterResponse::Reject {
                    reason: e.to_string(),
                }
            }),
        }
    }

    pub async fn cancel(&self, lp: &str, lp_order_id: &str) -> AdapterResponse {
        match self {
            Self::Simulated(sim) => sim.cancel(lp_order_id),
            Self::Rest(rest) => rest.cancel(lp_order_id).await.unwrap_or_else(|e| {
                warn!(lp, error = %e, "REST cancel failed");
                AdapterResponse::Reject {
                    reason: e.to_string(),
                }
            }),
        }
    }

    /// Venue-side open order ids, used to reconcile after a reconnect.
    pub async fn open_orders(&self) -> Vec<String> {
        match self {
            Self::Simulated(sim) => sim.open_orders(),
            Self::Rest(rest) => rest.open_orders().await.unwrap_or_default(),
        }
    }
}

// =============================================================================
// Simulated venue
// =============================================================================

/// Deterministic in-process venue: every accepted order fills fully at its
/// reference price plus a fixed improvement, immediately.
pub struct SimulatedLp {
    clock: SharedClock,
    next_order_id: AtomicU64,
    /// Added to buy prices / subtracted from sell prices, in price units.
    price_adjust: Decimal,
    /// Orders above this size are rejected (None = accept everything).
    max_order_qty: Option<Decimal>,
    open: RwLock<Vec<String>>,
}

impl SimulatedLp {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            next_order_id: AtomicU64::new(1),
            price_adjust: Decimal::ZERO,
            max_order_qty: None,
            open: RwLock::new(Vec::new()),
        }
    }

    pub fn with_price_adjust(mut self, adjust: Decimal) -> Self {
        self.price_adjust = adjust;
        self
    }

    pub fn with_max_order_qty(mut self, max: Decimal) -> Self {
        self.max_order_qty = Some(max);
        self
    }

    fn submit(&self, lp: &str, req: &SubmitRequest) -> AdapterResponse {
        if let Some(max) = self.max_order_qty {
            if req.qty > max {
                return AdapterResponse::Reject {
                    reason: format!("order qty {} above venue cap {}", req.qty, max),
                };
            }
        }

        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let lp_order_id = format!("{lp}-{id}");

        let price = match req.side {
            crate::types::Side::Buy => req.price_hint + self.price_adjust,
            crate::types::Side::Sell => req.price_hint - self.price_adjust,
        };

        let fill = LpFill {
            lp: lp.to_string(),
            lp_order_id: lp_order_id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            qty: req.qty,
            price,
            ts: self.clock.now_ms(),
        };

        debug!(lp, lp_order_id = %lp_order_id, qty = %req.qty, price = %price, "simulated fill");

        AdapterResponse::Ack {
            lp_order_id,
            fill: Some(fill),
        }
    }

    fn cancel(&self, lp_order_id: &str) -> AdapterResponse {
        let mut open = self.open.write();
        open.retain(|id| id != lp_order_id);
        AdapterResponse::Ack {
            lp_order_id: lp_order_id.to_string(),
            fill: None,
        }
    }

    fn open_orders(&self) -> Vec<String> {
        self.open.read().clone()
    }
}

// =============================================================================
// Signed REST venue
// =============================================================================

/// HMAC-SHA256 signed REST venue client. The secret never leaves this struct
/// and is never logged; the API key travels as a default header.
pub struct SignedRestLp {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    clock: SharedClock,
}

impl SignedRestLp {
    pub fn new(
        clock: SharedClock,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(val) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
            clock,
        }
    }

    /// HMAC-SHA256 hex signature over `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full query string for a signed request (timestamp, recv window,
    /// signature appended).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.clock.now_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn submit(&self, req: &SubmitRequest) -> Result<AdapterResponse> {
        let params = format!(
            "clientOrderId={}&symbol={}&side={}&qty={}&price={}",
            req.client_order_id, req.symbol, req.side, req.qty, req.price_hint
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/v1/orders?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /v1/orders request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;

        if !status.is_success() {
            return Ok(AdapterResponse::Reject {
                reason: format!("venue returned {status}: {body}"),
            });
        }

        let lp_order_id = body
            .get("orderId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(AdapterResponse::Ack {
            lp_order_id,
            fill: None,
        })
    }

    async fn cancel(&self, lp_order_id: &str) -> Result<AdapterResponse> {
        let params = format!("orderId={lp_order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/v1/orders/cancel?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /v1/orders/cancel request failed")?;

        if resp.status().is_success() {
            Ok(AdapterResponse::Ack {
                lp_order_id: lp_order_id.to_string(),
                fill: None,
            })
        } else {
            Ok(AdapterResponse::Reject {
                reason: format!("cancel rejected with {}", resp.status()),
            })
        }
    }

    async fn open_orders(&self) -> Result<Vec<String>> {
        let qs = self.signed_query("");
        let url = format!("{}/v1/orders/open?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v1/orders/open request failed")?;

        let body: serde_json::Value =
            resp.json().await.context("failed to parse open orders")?;

        Ok(body
            .get("orders")
            .and_then(|v| v.as_array())
            .map(|orders| {
                orders
                    .iter()
                    .filter_map(|o| o.get("orderId").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Side;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn request(id: &str, qty: Decimal) -> SubmitRequest {
        SubmitRequest {
            client_order_id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            qty,
            price_hint: dec!(1.10020),
        }
    }

    #[test]
    fn simulated_fill_at_reference_price() {
        let sim = SimulatedLp::new(Arc::new(ManualClock::new(1_000)));
        match sim.submit("LP-X", &request("c1", dec!(1))) {
            AdapterResponse::Ack { lp_order_id, fill } => {
                assert!(lp_order_id.starts_with("LP-X-"));
                let fill = fill.unwrap();
                assert_eq!(fill.price, dec!(1.10020));
                assert_eq!(fill.qty, dec!(1));
                assert_eq!(fill.ts, 1_000);
            }
            AdapterResponse::Reject { reason } => panic!("unexpected reject: {reason}"),
        }
    }

    #[test]
    fn simulated_price_adjust_widens_buys() {
        let sim = SimulatedLp::new(Arc::new(ManualClock::new(0))).with_price_adjust(dec!(0.00001));
        match sim.submit("LP-X", &request("c1", dec!(1))) {
            AdapterResponse::Ack { fill, .. } => {
                assert_eq!(fill.unwrap().price, dec!(1.10021));
            }
            _ => panic!("expected ack"),
        }
    }

    #[test]
    fn simulated_rejects_oversized_orders() {
        let sim = SimulatedLp::new(Arc::new(ManualClock::new(0))).with_max_order_qty(dec!(5));
        match sim.submit("LP-X", &request("big", dec!(10))) {
            AdapterResponse::Reject { reason } => assert!(reason.contains("above venue cap")),
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn rest_signature_is_deterministic() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let lp = SignedRestLp::new(clock, "https://lp.example", "key", "secret");
        let a = lp.sign("symbol=EURUSD&qty=1");
        let b = lp.sign("symbol=EURUSD&qty=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // hex SHA-256
        assert_ne!(a, lp.sign("symbol=EURUSD&qty=2"));
    }

    #[test]
    fn signed_query_contains_timestamp_and_signature() {
        let clock = Arc::new(ManualClock::new(42_000));
        let lp = SignedRestLp::new(clock, "https://lp.example", "key", "secret");
        let qs = lp.signed_query("a=1");
        assert!(qs.starts_with("a=1&timestamp=42000&recvWindow=5000&signature="));
    }
}
