// ===============================
// src/trader.rs
// ===============================
//
// Order manager: sole owner of the open-order book.
// Each loop: wait up to `command_wait` for an intent and submit it, then
// re-check every tracked order:
//   filled               -> forget (done)
//   cancelled by venue   -> forget
//   open and too old     -> forget, then ask the venue to cancel (best effort)
// An order the venue refuses to cancel is still forgotten: tracking is at-most-once.
//
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::config::{StageCfg, TraderCfg};
use crate::domain::{Event, OpenOrder, OrderEventKind, OrderIntent, OrderStatus};
use crate::error::{StageError, VenueError};
use crate::exchange::ExchangeClient;
use crate::metrics::{OPEN_ORDERS, ORDERS};
use crate::notify::{Notifier, OrderRecord};
use crate::recorder::Journal;
use crate::stage::{ErrorBudget, Stage, Verdict};

pub struct OrderManager {
    ex: Arc<ExchangeClient>,
    cfg: TraderCfg,
    stage_cfg: StageCfg,
    cmd_rx: mpsc::Receiver<OrderIntent>,
    orders: HashMap<String, OpenOrder>,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    producers_gone: bool,
}

impl OrderManager {
    pub fn new(
        ex: Arc<ExchangeClient>,
        cfg: TraderCfg,
        stage_cfg: StageCfg,
        cmd_rx: mpsc::Receiver<OrderIntent>,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
    ) -> Self {
        Self {
            ex,
            cfg,
            stage_cfg,
            cmd_rx,
            orders: HashMap::new(),
            notifier,
            journal,
            producers_gone: false,
        }
    }

    pub fn open_orders(&self) -> usize { self.orders.len() }

    #[cfg(test)]
    pub fn is_tracking(&self, order_id: &str) -> bool { self.orders.contains_key(order_id) }

    fn lifecycle(&self, kind: OrderEventKind, order_id: Option<String>, intent: &OrderIntent, title: &str) {
        let rec = OrderRecord::from(intent);
        info!("{}", rec.console_line(title));
        self.notifier.order(title, &rec);
        ORDERS.with_label_values(&[kind.as_str()]).inc();
        self.journal.record(Event::Order { kind, order_id, intent: intent.clone() });
    }

    /// A timeout is not an error: it just means no new intent this round.
    async fn next_command(&mut self) -> Option<OrderIntent> {
        if self.producers_gone {
            sleep(self.cfg.command_wait).await;
            return None;
        }
        match timeout(self.cfg.command_wait, self.cmd_rx.recv()).await {
            Ok(Some(intent)) => Some(intent),
            Ok(None) => {
                warn!("command queue closed, only housekeeping from now on");
                self.producers_gone = true;
                None
            }
            Err(_) => None,
        }
    }

    pub async fn submit(&mut self, intent: OrderIntent) -> Result<(), StageError> {
        let ack = self.ex.submit_order(intent.side, &intent.symbol, intent.amount, intent.price).await?;
        if !ack.accepted {
            warn!(reason = ack.message.as_deref().unwrap_or("-"), "failed to create order");
            self.lifecycle(OrderEventKind::Rejected, None, &intent, "REJECTED order");
            return Ok(());
        }
        let order_id = ack
            .order_id
            .ok_or_else(|| VenueError::Malformed("accepted order without order_id".into()))?;
        self.lifecycle(OrderEventKind::Submitted, Some(order_id.clone()), &intent, "NEW order");
        let created_ms = self.ex.now_millis();
        self.orders.insert(order_id.clone(), OpenOrder { order_id, intent, created_ms });
        OPEN_ORDERS.set(self.open_orders() as i64);
        Ok(())
    }

    pub async fn housekeeping(&mut self) -> Result<(), StageError> {
        let max_age_ms = self.cfg.max_order_age.as_millis() as i64;
        let ids: Vec<String> = self.orders.keys().cloned().collect();

        for id in ids {
            let status = self.ex.query_order(&id).await?;
            let now_ms = self.ex.now_millis();
            let expired = self.orders.get(&id).map(|o| o.age_ms(now_ms) > max_age_ms).unwrap_or(false);

            match status {
                OrderStatus::Filled => {
                    if let Some(o) = self.orders.remove(&id) {
                        self.lifecycle(OrderEventKind::Filled, Some(id.clone()), &o.intent, "FIN order");
                    }
                }
                OrderStatus::Cancelled => {
                    if let Some(o) = self.orders.remove(&id) {
                        self.lifecycle(OrderEventKind::Cancelled, Some(id.clone()), &o.intent, "CXL order");
                    }
                }
                OrderStatus::Open | OrderStatus::Other(_) if expired => {
                    if let Some(o) = self.orders.remove(&id) {
                        self.lifecycle(OrderEventKind::Expired, Some(id.clone()), &o.intent, "DEL order");
                        match self.ex.cancel_order(&o.intent.symbol, &id).await {
                            Ok(st) => debug!(order_id = %id, status = ?st, "cancel requested"),
                            Err(e) => {
                                warn!(order_id = %id, error = %e, "cancel failed, order no longer tracked");
                                self.notifier.alert(&format!("Cancel failed for expired order {id}: {e}"));
                            }
                        }
                    }
                }
                OrderStatus::Open | OrderStatus::Other(_) => {}
            }
        }
        OPEN_ORDERS.set(self.open_orders() as i64);
        Ok(())
    }

    pub async fn cycle(&mut self) -> Result<(), StageError> {
        if let Some(intent) = self.next_command().await {
            self.submit(intent).await?;
        }
        self.housekeeping().await
    }

    pub async fn run(mut self) -> Stage {
        let mut budget = ErrorBudget::new(Stage::Trader, &self.stage_cfg);
        info!(max_order_age_s = self.cfg.max_order_age.as_secs(), "trader started");
        loop {
            match self.cycle().await {
                Ok(()) => budget.succeeded(),
                Err(e) => match budget.failed(&e, self.notifier.as_ref()) {
                    Verdict::Retry(d) => sleep(d).await,
                    Verdict::Halt => {
                        warn!(untracked = self.open_orders(), "trader stopped; open orders are no longer managed");
                        return Stage::Trader;
                    }
                },
            }
        }
    }
}
