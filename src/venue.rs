// ===============================
// src/venue.rs
// ===============================
//
// Raw venue access. Implementations do one request per call and never retry;
// retry and serialization live in `exchange::ExchangeClient`.
//
// - BtcTradeVenue (src/btctrade.rs) : real REST venue
// - MockVenue                        : in-process venue (dry runs + tests)
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::{OrderAck, OrderStatus, PriceEstimate, Side, Trade};
use crate::error::VenueError;

#[async_trait]
pub trait Venue: Send + Sync {
    async fn submit_order(&self, side: Side, symbol: &str, amount: f64, price: f64) -> Result<OrderAck, VenueError>;
    async fn query_order(&self, order_id: &str) -> Result<OrderStatus, VenueError>;
    /// Unconditional cancel request; callers check cancelability first.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError>;
    async fn fetch_recent_trades(&self, symbol: &str) -> Result<Vec<Trade>, VenueError>;
    async fn estimate_price(&self, side: Side, symbol: &str, amount: f64) -> Result<PriceEstimate, VenueError>;

    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Which call a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op { Submit, Query, Cancel, Trades, Estimate }

/// Deals kept in the synthetic feed window
const SIM_FEED_WINDOW: usize = 50;
/// Counterparty that is never a target, so the watcher's filter has something to drop
const SIM_BYSTANDER: &str = "bystander";

struct MockOrder {
    status: OrderStatus,
    created_ms: i64,
}

/// Random-walk market behind `VENUE_MODE=mock`.
struct Simulation {
    users: Vec<String>,
    next_deal: u64,
    fill_after_ms: i64,
}

#[derive(Default)]
struct MockState {
    trades: Vec<Trade>,
    orders: HashMap<String, MockOrder>,
    next_id: u64,
    reject_next: bool,
    failures: HashMap<Op, VecDeque<VenueError>>,
    calls: HashMap<Op, usize>,
    end_price: f64,
    clock_ms: Option<i64>,
    sim: Option<Simulation>,
}

impl MockState {
    fn now(&self) -> i64 {
        self.clock_ms.unwrap_or_else(|| Utc::now().timestamp_millis())
    }

    /// 1..=3 new deals per fetch; the end price drifts with them.
    fn simulate_deals(&mut self) {
        let now = self.now();
        let Some(sim) = self.sim.as_mut() else { return };
        let mut rng = rand::thread_rng();
        for _ in 0..rng.gen_range(1..=3) {
            self.end_price = (self.end_price * (1.0 + rng.gen_range(-0.003..=0.003))).max(0.01);
            let user = if sim.users.is_empty() || rng.gen_bool(0.25) {
                SIM_BYSTANDER.to_string()
            } else {
                sim.users[rng.gen_range(0..sim.users.len())].clone()
            };
            self.trades.push(Trade {
                id: format!("S{}", sim.next_deal),
                ts_ms: now,
                side: if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
                amount: (rng.gen_range(1.0..100.0_f64) * 100.0).round() / 100.0,
                price: self.end_price,
                user,
            });
            sim.next_deal += 1;
        }
        let excess = self.trades.len().saturating_sub(SIM_FEED_WINDOW);
        self.trades.drain(..excess);
    }

    /// Open orders fill once they have rested long enough.
    fn simulate_fill(&mut self, order_id: &str) {
        let now = self.now();
        let Some(sim) = self.sim.as_ref() else { return };
        if let Some(o) = self.orders.get_mut(order_id) {
            if o.status == OrderStatus::Open && now - o.created_ms >= sim.fill_after_ms {
                o.status = OrderStatus::Filled;
            }
        }
    }
}

/// In-process venue.
/// Scripted (tests): the feed is whatever `set_trades` put there, orders stay
/// `Open` until `fill` / cancel, estimates use one fixed end price.
/// Simulated (`MockVenue::simulated`): every fetch adds random deals, the end
/// price random-walks, resting orders fill after `fill_after`.
pub struct MockVenue {
    state: Mutex<MockState>,
}

impl Default for MockVenue {
    fn default() -> Self { Self::new(100.0) }
}

impl MockVenue {
    pub fn new(end_price: f64) -> Self {
        Self { state: Mutex::new(MockState { end_price, next_id: 1, ..Default::default() }) }
    }

    /// Dry-run market: deals come from `users` (plus a non-target bystander).
    pub fn simulated(users: Vec<String>, fill_after: Duration) -> Self {
        let sim = Simulation { users, next_deal: 1, fill_after_ms: fill_after.as_millis() as i64 };
        Self { state: Mutex::new(MockState { end_price: 100.0, next_id: 1, sim: Some(sim), ..Default::default() }) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        // a poisoned lock only means a test thread panicked; keep the state usable
        let mut g = match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        f(&mut g)
    }

    fn take_failure(&self, op: Op) -> Result<(), VenueError> {
        self.with(|s| {
            *s.calls.entry(op).or_default() += 1;
            match s.failures.get_mut(&op).and_then(|q| q.pop_front()) {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

/// Test scripting.
#[cfg(test)]
impl MockVenue {
    pub fn set_trades(&self, trades: Vec<Trade>) { self.with(|s| s.trades = trades) }
    pub fn set_clock(&self, now_ms: i64) { self.with(|s| s.clock_ms = Some(now_ms)) }
    pub fn reject_next_order(&self) { self.with(|s| s.reject_next = true) }
    pub fn fail_next(&self, op: Op, err: VenueError) {
        self.with(|s| s.failures.entry(op).or_default().push_back(err))
    }
    pub fn fill(&self, order_id: &str) {
        self.with(|s| {
            if let Some(o) = s.orders.get_mut(order_id) {
                o.status = OrderStatus::Filled;
            }
        })
    }
    pub fn status_of(&self, order_id: &str) -> Option<OrderStatus> {
        self.with(|s| s.orders.get(order_id).map(|o| o.status.clone()))
    }
    pub fn calls(&self, op: Op) -> usize { self.with(|s| s.calls.get(&op).copied().unwrap_or(0)) }
}

#[async_trait]
impl Venue for MockVenue {
    async fn submit_order(&self, _side: Side, _symbol: &str, _amount: f64, _price: f64) -> Result<OrderAck, VenueError> {
        self.take_failure(Op::Submit)?;
        Ok(self.with(|s| {
            if std::mem::take(&mut s.reject_next) {
                return OrderAck { accepted: false, order_id: None, message: Some("insufficient balance".into()) };
            }
            let id = format!("M{}", s.next_id);
            s.next_id += 1;
            let created_ms = s.now();
            s.orders.insert(id.clone(), MockOrder { status: OrderStatus::Open, created_ms });
            OrderAck { accepted: true, order_id: Some(id), message: None }
        }))
    }

    async fn query_order(&self, order_id: &str) -> Result<OrderStatus, VenueError> {
        self.take_failure(Op::Query)?;
        self.with(|s| {
            s.simulate_fill(order_id);
            s.orders.get(order_id).map(|o| o.status.clone())
        })
        .ok_or_else(|| VenueError::Rejected(format!("unknown order {order_id}")))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        self.take_failure(Op::Cancel)?;
        self.with(|s| match s.orders.get_mut(order_id) {
            Some(o) => {
                o.status = OrderStatus::Cancelled;
                Ok(OrderStatus::Cancelled)
            }
            None => Err(VenueError::Rejected(format!("unknown order {order_id}"))),
        })
    }

    async fn fetch_recent_trades(&self, _symbol: &str) -> Result<Vec<Trade>, VenueError> {
        self.take_failure(Op::Trades)?;
        Ok(self.with(|s| {
            s.simulate_deals();
            s.trades.clone()
        }))
    }

    async fn estimate_price(&self, _side: Side, _symbol: &str, amount: f64) -> Result<PriceEstimate, VenueError> {
        self.take_failure(Op::Estimate)?;
        Ok(self.with(|s| PriceEstimate { end_price: s.end_price, total: s.end_price * amount }))
    }

    fn now_millis(&self) -> i64 {
        self.with(|s| s.now())
    }
}
