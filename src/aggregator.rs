// ===============================
// src/aggregator.rs
// ===============================
//
// Signal aggregator: wakes when a feed batch is ready, drains every queued
// trade, and turns the net buy/sell flow into at most one order intent.
//
// - wash filter : both sides present and |1 - buy/sell| < threshold -> no intent
// - direction   : the heavier side; amount = |buy - sell| * order_amount_mult
// - limit price : venue's indicative end price for that amount, pushed toward
//                 fill (buy * buy_price_mult, sell * sell_price_mult)
//
// Each batch is computed from scratch; nothing carries over between cycles.
//
use std::sync::Arc;
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, info, warn};

use crate::config::{AggregatorCfg, StageCfg};
use crate::domain::{Event, IntentOrigin, OrderIntent, Side, Trade};
use crate::error::StageError;
use crate::exchange::ExchangeClient;
use crate::latch::BatchReadyLatch;
use crate::metrics::{SIGNALS, WASH_SUPPRESSED};
use crate::notify::{Notifier, OrderRecord};
use crate::recorder::Journal;
use crate::stage::{ErrorBudget, Stage, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowSummary {
    pub total_buy: f64,
    pub total_sell: f64,
    /// None when the side has no volume
    pub weighted_buy: Option<f64>,
    pub weighted_sell: Option<f64>,
}

impl FlowSummary {
    pub fn from_batch(batch: &[Trade]) -> Self {
        let (mut buy, mut sell, mut buy_notional, mut sell_notional) = (0.0, 0.0, 0.0, 0.0);
        for t in batch {
            match t.side {
                Side::Buy => {
                    buy += t.amount;
                    buy_notional += t.amount * t.price;
                }
                Side::Sell => {
                    sell += t.amount;
                    sell_notional += t.amount * t.price;
                }
            }
        }
        let vwap = |notional: f64, total: f64| if total > 0.0 { Some(notional / total) } else { None };
        Self {
            total_buy: buy,
            total_sell: sell,
            weighted_buy: vwap(buy_notional, buy),
            weighted_sell: vwap(sell_notional, sell),
        }
    }

    pub fn is_wash(&self, threshold: f64) -> bool {
        self.total_buy > 0.0 && self.total_sell > 0.0 && (1.0 - self.total_buy / self.total_sell).abs() < threshold
    }

    /// Heavier side and the flow imbalance.
    pub fn imbalance(&self) -> (Side, f64) {
        if self.total_buy > self.total_sell {
            (Side::Buy, self.total_buy - self.total_sell)
        } else {
            (Side::Sell, self.total_sell - self.total_buy)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Wash,
    /// no imbalance to trade
    Flat,
    Signal { side: Side, amount: f64 },
}

pub fn decide(summary: &FlowSummary, cfg: &AggregatorCfg) -> Decision {
    if summary.is_wash(cfg.wash_threshold) {
        return Decision::Wash;
    }
    let (side, delta) = summary.imbalance();
    let amount = delta * cfg.order_amount_mult;
    if amount > 0.0 { Decision::Signal { side, amount } } else { Decision::Flat }
}

pub struct SignalAggregator {
    ex: Arc<ExchangeClient>,
    cfg: AggregatorCfg,
    stage_cfg: StageCfg,
    trade_rx: mpsc::UnboundedReceiver<Trade>,
    cmd_tx: mpsc::Sender<OrderIntent>,
    latch: BatchReadyLatch,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    trader_gone: bool,
}

impl SignalAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ex: Arc<ExchangeClient>,
        cfg: AggregatorCfg,
        stage_cfg: StageCfg,
        trade_rx: mpsc::UnboundedReceiver<Trade>,
        cmd_tx: mpsc::Sender<OrderIntent>,
        latch: BatchReadyLatch,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
    ) -> Self {
        Self { ex, cfg, stage_cfg, trade_rx, cmd_tx, latch, notifier, journal, trader_gone: false }
    }

    fn drain(&mut self) -> Vec<Trade> {
        let mut batch = Vec::new();
        while let Ok(t) = self.trade_rx.try_recv() {
            batch.push(t);
        }
        batch
    }

    /// Waits for the latch, processes everything queued, clears the latch on every exit path.
    pub async fn cycle(&mut self) -> Result<Option<OrderIntent>, StageError> {
        let latch = self.latch.clone();
        latch.wait().await;
        let _clear = latch.clear_on_drop();

        let batch = self.drain();
        if batch.is_empty() {
            return Ok(None);
        }
        self.process(&batch).await
    }

    async fn process(&mut self, batch: &[Trade]) -> Result<Option<OrderIntent>, StageError> {
        let flow = FlowSummary::from_batch(batch);
        info!(
            trades = batch.len(),
            buy = flow.total_buy,
            sell = flow.total_sell,
            vwap_buy = ?flow.weighted_buy,
            vwap_sell = ?flow.weighted_sell,
            "batch flow"
        );

        let (side, amount) = match decide(&flow, &self.cfg) {
            Decision::Wash => {
                info!("fast buy/sell combination, no signal");
                WASH_SUPPRESSED.inc();
                return Ok(None);
            }
            Decision::Flat => {
                debug!("no imbalance");
                return Ok(None);
            }
            Decision::Signal { side, amount } => (side, amount),
        };

        let est = self.ex.estimate_execution_price(side, &self.cfg.symbol, amount).await?;
        let mult = match side {
            Side::Buy => self.cfg.buy_price_mult,
            Side::Sell => self.cfg.sell_price_mult,
        };
        let price = est.end_price * mult;
        if !(price.is_finite() && price > 0.0) || !amount.is_finite() {
            return Err(StageError::Arithmetic(format!("unusable order {amount} @ {price}")));
        }

        let intent = OrderIntent {
            side,
            symbol: self.cfg.symbol.clone(),
            amount,
            price,
            ts_ms: self.ex.now_millis(),
            origin: IntentOrigin::Signal,
        };
        let rec = OrderRecord::from(&intent);
        info!("{}", rec.console_line("Analyzer's idea"));
        self.notifier.order("Analyzer's idea", &rec);
        self.journal.record(Event::Intent(intent.clone()));
        SIGNALS.with_label_values(&[side.as_str()]).inc();

        // a stopped trader is not our failure: keep analysing, drop the intent
        if self.cmd_tx.send(intent.clone()).await.is_err() {
            if !self.trader_gone {
                warn!("command queue closed, intents are dropped from now on");
                self.trader_gone = true;
            }
            return Ok(None);
        }
        Ok(Some(intent))
    }

    pub async fn run(mut self) -> Stage {
        let mut budget = ErrorBudget::new(Stage::Aggregator, &self.stage_cfg);
        info!(symbol = %self.cfg.symbol, wash_threshold = self.cfg.wash_threshold, "aggregator started");
        loop {
            match self.cycle().await {
                Ok(_) => budget.succeeded(),
                Err(e) => match budget.failed(&e, self.notifier.as_ref()) {
                    Verdict::Retry(d) => sleep(d).await,
                    Verdict::Halt => {
                        warn!("aggregator stopped");
                        return Stage::Aggregator;
                    }
                },
            }
        }
    }
}
