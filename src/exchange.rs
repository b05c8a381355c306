// ===============================
// src/exchange.rs
// ===============================
//
// Every venue call goes through one async mutex, held for the whole call
// including retry sleeps, so the venue sees requests strictly one at a time
// (its nonces must increase). Network failures are retried forever after a
// fixed delay; any other error goes straight back to the caller.
//
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::Mutex, time::sleep};
use tracing::debug;

use crate::domain::{OrderAck, OrderStatus, PriceEstimate, Side, Trade};
use crate::error::VenueError;
use crate::metrics::VENUE_RETRIES;
use crate::venue::Venue;

pub const RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct ExchangeClient {
    venue: Arc<dyn Venue>,
    lock: Mutex<()>,
    retry_delay: Duration,
}

impl ExchangeClient {
    pub fn new(venue: Arc<dyn Venue>) -> Self {
        Self::with_retry_delay(venue, RETRY_DELAY)
    }

    pub fn with_retry_delay(venue: Arc<dyn Venue>, retry_delay: Duration) -> Self {
        Self { venue, lock: Mutex::new(()), retry_delay }
    }

    /// Caller must already hold `self.lock`.
    async fn retrying<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, VenueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VenueError>>,
    {
        loop {
            match call().await {
                Err(e) if e.is_transient() => {
                    debug!(op, error = %e, "venue network error, retrying");
                    VENUE_RETRIES.with_label_values(&[op]).inc();
                    sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }

    pub async fn submit_order(&self, side: Side, symbol: &str, amount: f64, price: f64) -> Result<OrderAck, VenueError> {
        let _guard = self.lock.lock().await;
        self.retrying("submit_order", || self.venue.submit_order(side, symbol, amount, price)).await
    }

    pub async fn query_order(&self, order_id: &str) -> Result<OrderStatus, VenueError> {
        let _guard = self.lock.lock().await;
        self.retrying("query_order", || self.venue.query_order(order_id)).await
    }

    /// Re-checks the order first; anything no longer cancelable is returned as-is.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        let _guard = self.lock.lock().await;
        let current = self.retrying("query_order", || self.venue.query_order(order_id)).await?;
        if !current.is_cancelable() {
            return Ok(current);
        }
        self.retrying("cancel_order", || self.venue.cancel_order(symbol, order_id)).await
    }

    pub async fn fetch_recent_trades(&self, symbol: &str) -> Result<Vec<Trade>, VenueError> {
        let _guard = self.lock.lock().await;
        self.retrying("fetch_recent_trades", || self.venue.fetch_recent_trades(symbol)).await
    }

    pub async fn estimate_execution_price(&self, side: Side, symbol: &str, amount: f64) -> Result<PriceEstimate, VenueError> {
        let _guard = self.lock.lock().await;
        self.retrying("estimate_price", || self.venue.estimate_price(side, symbol, amount)).await
    }

    /// Local clock read; no venue round trip, so no lock.
    pub fn now_millis(&self) -> i64 {
        self.venue.now_millis()
    }
}
