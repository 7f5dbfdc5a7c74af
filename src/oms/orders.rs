// =============================================================================
// Order Store — order state machine and fill application
// =============================================================================
//
// Life-cycle:
//   pending -> new -> (partiallyFilled*)? -> filled
//   pending -> rejected
//   new | partiallyFilled -> cancelled | expired
//
// Fills only ever reduce `remaining`; the invariant
// `remaining + Σ fill.qty == qty` holds after every accepted transition.
// Fills for unknown orders are refused (duplicates or re-ordered venue
// events after a reconnect).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::types::{
    ExecutionPath, LiquidityRole, OrderKind, OrderState, RejectReason, Rejection, Side, Tif,
};

/// One execution against an order. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub qty: Decimal,
    pub price: Decimal,
    pub liquidity: LiquidityRole,
    pub venue: String,
    pub ts: u64,
}

/// A client order tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Decimal,
    pub remaining: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    pub tif: Tif,
    /// Expiry for GTD orders, epoch millis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub good_till: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tp: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_distance: Option<Decimal>,
    pub state: OrderState,
    /// Set when a journal write failed mid-transition; a reconciliation pass
    /// must clear it before the order counts as closed.
    #[serde(default)]
    pub uncertain: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_path: Option<ExecutionPath>,
    /// Shared by both legs of a split execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Present on synthetic closes: the position this order unwinds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_position_id: Option<String>,
    pub fills: Vec<Fill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    pub fn filled_qty(&self) -> Decimal {
        self.fills.iter().map(|f| f.qty).sum()
    }
}

/// Parameters for a new order record.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub account_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub tif: Tif,
    pub good_till: Option<u64>,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    pub trailing_distance: Option<Decimal>,
    /// Set on synthetic closes so fills unwind the right position.
    pub close_position_id: Option<String>,
}

// =============================================================================
// Order Store
// =============================================================================

/// Thread-safe owner of every order record.
pub struct OrderStore {
    orders: RwLock<HashMap<String, Order>>,
    by_client: RwLock<HashMap<(String, String), String>>,
    clock: SharedClock,
}

impl OrderStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            by_client: RwLock::new(HashMap::new()),
            clock,
        }
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// Record a new order in `pending` state and return it.
    pub fn create(&self, new: NewOrder) -> Order {
        let now = self.clock.now_ms();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            account_id: new.account_id.clone(),
            client_order_id: new.client_order_id.clone(),
            symbol: new.symbol,
            side: new.side,
            kind: new.kind,
            qty: new.qty,
            remaining: new.qty,
            limit_price: new.limit_price,
            stop_price: new.stop_price,
            tif: new.tif,
            good_till: new.good_till,
            sl: new.sl,
            tp: new.tp,
            trailing_distance: new.trailing_distance,
            state: OrderState::Pending,
            uncertain: false,
            routing_path: None,
            correlation_id: None,
            close_position_id: new.close_position_id,
            fills: Vec::new(),
            reject_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.by_client.write().insert(
            (new.account_id, new.client_order_id),
            order.id.clone(),
        );
        self.orders.write().insert(order.id.clone(), order.clone());
        order
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<Order> {
        self.orders.read().get(id).cloned()
    }

    pub fn get_by_client(&self, account_id: &str, client_order_id: &str) -> Option<Order> {
        let id = self
            .by_client
            .read()
            .get(&(account_id.to_string(), client_order_id.to_string()))
            .cloned()?;
        self.get(&id)
    }

    /// Orders still working (pending, new, or partially filled).
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn orders_for_account(&self, account_id: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    /// Orders whose journaled state may diverge from memory.
    pub fn uncertain_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.uncertain)
            .cloned()
            .collect()
    }

    /// Non-terminal order count per account, for backpressure.
    pub fn pending_count(&self, account_id: &str) -> usize {
        self.orders
            .read()
            .values()
            .filter(|o| o.account_id == account_id && !o.state.is_terminal())
            .count()
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn with_order<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Order) -> Result<T, Rejection>,
    ) -> Result<T, Rejection> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(id)
            .ok_or_else(|| Rejection::new(RejectReason::UnknownOrder))?;
        let result = f(order);
        if result.is_ok() {
            order.updated_at = self.clock.now_ms();
        }
        result
    }

    /// `pending -> new`: the routing decision accepted an execution path.
    pub fn accept(&self, id: &str, path: ExecutionPath, correlation_id: Option<String>) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            if order.state != OrderState::Pending {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            order.state = OrderState::New;
            order.routing_path = Some(path);
            order.correlation_id = correlation_id;
            Ok(order.clone())
        })
    }

    /// `pending -> rejected` with the taxonomy reason.
    pub fn reject(&self, id: &str, reason: RejectReason) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            if order.state.is_terminal() {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            order.state = OrderState::Rejected;
            order.reject_reason = Some(reason);
            info!(order_id = %order.id, reason = %reason, "order rejected");
            Ok(order.clone())
        })
    }

    /// Apply one execution. Unknown orders, terminal orders, and overfills
    /// are refused.
    pub fn apply_fill(
        &self,
        id: &str,
        qty: Decimal,
        price: Decimal,
        liquidity: LiquidityRole,
        venue: &str,
    ) -> Result<(Order, Fill), Rejection> {
        if qty <= Decimal::ZERO {
            return Err(Rejection::new(RejectReason::InvalidOrder));
        }
        let now = self.clock.now_ms();
        self.with_order(id, |order| {
            if order.state.is_terminal() || order.state == OrderState::Pending {
                warn!(order_id = %id, state = %order.state, "fill refused in current state");
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            if qty > order.remaining {
                warn!(order_id = %id, qty = %qty, remaining = %order.remaining, "overfill refused");
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }

            // Fill timestamps are monotonic per order.
            let ts = order
                .fills
                .last()
                .map(|f| f.ts.max(now))
                .unwrap_or(now);

            let fill = Fill {
                id: Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                qty,
                price,
                liquidity,
                venue: venue.to_string(),
                ts,
            };

            order.remaining -= qty;
            order.fills.push(fill.clone());
            order.state = if order.remaining.is_zero() {
                OrderState::Filled
            } else {
                OrderState::PartiallyFilled
            };

            info!(
                order_id = %order.id,
                qty = %qty,
                price = %price,
                remaining = %order.remaining,
                state = %order.state,
                "fill applied"
            );
            Ok((order.clone(), fill))
        })
    }

    /// Explicit cancel or TIF-driven cancel.
    pub fn cancel(&self, id: &str) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            match order.state {
                OrderState::Pending | OrderState::New | OrderState::PartiallyFilled => {
                    order.state = OrderState::Cancelled;
                    info!(order_id = %order.id, "order cancelled");
                    Ok(order.clone())
                }
                _ => Err(Rejection::new(RejectReason::InvalidOrder)),
            }
        })
    }

    /// DAY orders at session close, GTD orders past their date.
    pub fn expire(&self, id: &str) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            if order.state.is_terminal() {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            order.state = OrderState::Expired;
            info!(order_id = %order.id, tif = %order.tif, "order expired");
            Ok(order.clone())
        })
    }

    /// Update protective levels / limit price on a working order.
    pub fn modify(
        &self,
        id: &str,
        new_sl: Option<Decimal>,
        new_tp: Option<Decimal>,
        new_limit_price: Option<Decimal>,
    ) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            if order.state.is_terminal() {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            if let Some(sl) = new_sl {
                order.sl = Some(sl);
            }
            if let Some(tp) = new_tp {
                order.tp = Some(tp);
            }
            if let Some(px) = new_limit_price {
                if order.kind != OrderKind::Limit && order.kind != OrderKind::StopLimit {
                    return Err(Rejection::new(RejectReason::InvalidOrder));
                }
                order.limit_price = Some(px);
            }
            Ok(order.clone())
        })
    }

    /// Scale a working order down (exposure `reduce` action). Fails once any
    /// quantity has executed.
    pub fn reduce_qty(&self, id: &str, new_qty: Decimal) -> Result<Order, Rejection> {
        self.with_order(id, |order| {
            if order.state.is_terminal() || !order.fills.is_empty() {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            if new_qty <= Decimal::ZERO || new_qty > order.qty {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            info!(order_id = %order.id, from = %order.qty, to = %new_qty, "order quantity reduced");
            order.qty = new_qty;
            order.remaining = new_qty;
            Ok(order.clone())
        })
    }

    /// Move a resting stop (trailing ratchet).
    pub fn update_stop(&self, id: &str, stop_price: Decimal) -> Result<(), Rejection> {
        self.with_order(id, |order| {
            if order.state.is_terminal() {
                return Err(Rejection::new(RejectReason::InvalidOrder));
            }
            order.stop_price = Some(stop_price);
            Ok(())
        })
    }

    /// Flag an order whose journaled state may diverge from memory.
    pub fn mark_uncertain(&self, id: &str) {
        let _ = self.with_order(id, |order| {
            order.uncertain = true;
            warn!(order_id = %order.id, "order marked uncertain");
            Ok(())
        });
    }

    /// Clear the uncertainty flag after reconciliation.
    pub fn clear_uncertain(&self, id: &str) {
        let _ = self.with_order(id, |order| {
            order.uncertain = false;
            Ok(())
        });
    }

    /// GTD orders past `now` and, when `day_boundary` is true, every working
    /// DAY order. Returns the expired orders.
    pub fn sweep_expiries(&self, now_ms: u64, day_boundary: bool) -> Vec<Order> {
        let candidates: Vec<String> = self
            .orders
            .read()
            .values()
            .filter(|o| !o.state.is_terminal())
            .filter(|o| match o.tif {
                Tif::Gtd => o.good_till.map_or(false, |t| now_ms >= t),
                Tif::Day => day_boundary,
                _ => false,
            })
            .map(|o| o.id.clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|id| self.expire(&id).ok())
            .collect()
    }
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStore")
            .field("orders", &self.orders.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
