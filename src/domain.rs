// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}
impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One print from the venue's public trade feed. `user` is the counterparty name the venue publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade { pub id: String, pub ts_ms: i64, pub side: Side, pub amount: f64, pub price: f64, pub user: String }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentOrigin { Signal, Manual }

/// A request to place one limit order. Consumed exactly once by the trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: Side,
    pub symbol: String,
    pub amount: f64,
    pub price: f64,
    pub ts_ms: i64,
    pub origin: IntentOrigin,
}

/// Venue answer to an order submission. `accepted == false` is a business rejection, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck { pub accepted: bool, pub order_id: Option<String>, pub message: Option<String> }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { Open, Filled, Cancelled, Other(String) }
impl OrderStatus {
    pub fn is_cancelable(&self) -> bool { matches!(self, OrderStatus::Open) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder { pub order_id: String, pub intent: OrderIntent, pub created_ms: i64 }
impl OpenOrder {
    pub fn age_ms(&self, now_ms: i64) -> i64 { now_ms - self.created_ms }
}

/// Indicative execution for a given side/amount. `total` is what the whole amount costs (buy)
/// or yields (sell) in quote currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEstimate { pub end_price: f64, pub total: f64 }
impl PriceEstimate {
    pub fn average(&self, amount: f64) -> f64 { if amount > 0.0 { self.total / amount } else { self.end_price } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderEventKind { Submitted, Rejected, Filled, Cancelled, Expired }
impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::Submitted => "submitted",
            OrderEventKind::Rejected => "rejected",
            OrderEventKind::Filled => "filled",
            OrderEventKind::Cancelled => "cancelled",
            OrderEventKind::Expired => "expired",
        }
    }
}

/// Journal record (one JSON line each).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Trade(Trade),
    Intent(OrderIntent),
    Order { kind: OrderEventKind, order_id: Option<String>, intent: OrderIntent },
    Note(String),
}
