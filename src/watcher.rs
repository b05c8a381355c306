// ===============================
// src/watcher.rs
// ===============================
//
// Feed watcher: once per clock-aligned slot, pull the venue's recent trades and
// forward the target counterparties' fresh, size-qualified, unseen prints to
// the aggregator. A poll is skipped while the previous batch is still unclaimed
// (latch set). Each completed poll sets the latch.
//
use ahash::AHashMap as HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, time::sleep};
use tracing::{info, warn};

use crate::clock;
use crate::config::{StageCfg, WatcherCfg};
use crate::domain::{Event, Trade};
use crate::error::StageError;
use crate::exchange::ExchangeClient;
use crate::latch::BatchReadyLatch;
use crate::metrics::{TRADES_CLASSIFIED, TRADES_PUBLISHED};
use crate::notify::{Notifier, OrderRecord};
use crate::recorder::Journal;
use crate::stage::{ErrorBudget, Stage, Verdict};

/// Ids already classified, with the trade's own timestamp. Entries older than
/// the retention window are dropped; anything that old is stale on sight anyway.
pub struct SeenTrades {
    ids: HashMap<String, i64>,
    retention_ms: i64,
}

impl SeenTrades {
    pub fn new(retention: Duration) -> Self {
        Self { ids: HashMap::new(), retention_ms: retention.as_millis() as i64 }
    }
    pub fn contains(&self, id: &str) -> bool { self.ids.contains_key(id) }
    pub fn insert(&mut self, id: String, ts_ms: i64) -> bool { self.ids.insert(id, ts_ms).is_none() }
    pub fn len(&self) -> usize { self.ids.len() }

    pub fn evict_expired(&mut self, now_ms: i64) {
        let horizon = now_ms - self.retention_ms;
        self.ids.retain(|_, ts| *ts >= horizon);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// not ours, too small, or already seen
    Ignored,
    Fresh,
    Stale,
}

pub struct FeedWatcher {
    ex: Arc<ExchangeClient>,
    cfg: WatcherCfg,
    stage_cfg: StageCfg,
    trade_tx: mpsc::UnboundedSender<Trade>,
    latch: BatchReadyLatch,
    notifier: Arc<dyn Notifier>,
    journal: Journal,
    seen: SeenTrades,
    aggregator_gone: bool,
}

impl FeedWatcher {
    pub fn new(
        ex: Arc<ExchangeClient>,
        cfg: WatcherCfg,
        stage_cfg: StageCfg,
        trade_tx: mpsc::UnboundedSender<Trade>,
        latch: BatchReadyLatch,
        notifier: Arc<dyn Notifier>,
        journal: Journal,
    ) -> Self {
        let seen = SeenTrades::new(cfg.seen_retention);
        Self { ex, cfg, stage_cfg, trade_tx, latch, notifier, journal, seen, aggregator_gone: false }
    }

    pub fn classify(&self, t: &Trade, now_ms: i64) -> Class {
        let is_target = self.cfg.target_users.iter().any(|u| *u == t.user);
        if !is_target || t.amount < self.cfg.min_trade_amount || self.seen.contains(&t.id) {
            return Class::Ignored;
        }
        if now_ms - t.ts_ms < self.cfg.max_trade_age.as_millis() as i64 {
            Class::Fresh
        } else {
            Class::Stale
        }
    }

    /// One fetch/filter/publish pass. Returns how many trades were published.
    pub async fn poll_once(&mut self) -> Result<usize, StageError> {
        if self.latch.is_set() && !self.aggregator_gone {
            return Ok(0);
        }
        let now_ms = self.ex.now_millis();
        self.seen.evict_expired(now_ms);

        let mut trades = self.ex.fetch_recent_trades(&self.cfg.symbol).await?;
        trades.sort_by_key(|t| t.ts_ms);

        let mut published = 0;
        for t in trades {
            match self.classify(&t, now_ms) {
                Class::Ignored => continue,
                Class::Fresh => {
                    let title = format!("New trade ({})", t.user);
                    let rec = OrderRecord::from_trade(&t, &self.cfg.symbol);
                    info!("{}", rec.console_line(&title));
                    self.notifier.order(&title, &rec);
                    TRADES_CLASSIFIED.with_label_values(&["fresh"]).inc();

                    self.seen.insert(t.id.clone(), t.ts_ms);
                    self.journal.record(Event::Trade(t.clone()));
                    if self.trade_tx.send(t).is_ok() {
                        TRADES_PUBLISHED.inc();
                        published += 1;
                    } else if !self.aggregator_gone {
                        warn!("trade queue closed, fresh trades are only logged from now on");
                        self.aggregator_gone = true;
                    }
                }
                Class::Stale => {
                    let rec = OrderRecord::from_trade(&t, &self.cfg.symbol);
                    info!("{}", rec.console_line(&format!("Old trade ({})", t.user)));
                    TRADES_CLASSIFIED.with_label_values(&["stale"]).inc();
                    self.seen.insert(t.id, t.ts_ms);
                }
            }
        }

        self.latch.set();
        Ok(published)
    }

    pub async fn run(mut self) -> Stage {
        let mut budget = ErrorBudget::new(Stage::FeedWatcher, &self.stage_cfg);
        info!(
            symbol = %self.cfg.symbol,
            users = ?self.cfg.target_users,
            period_s = self.cfg.poll_period.as_secs(),
            "feed watcher started"
        );
        loop {
            match self.poll_once().await {
                Ok(_) => {
                    budget.succeeded();
                    clock::sleep_until_slot(self.cfg.poll_period).await;
                }
                Err(e) => match budget.failed(&e, self.notifier.as_ref()) {
                    Verdict::Retry(d) => sleep(d).await,
                    Verdict::Halt => {
                        warn!(seen = self.seen.len(), "feed watcher stopped");
                        return Stage::FeedWatcher;
                    }
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::trade;
    use super::*;
    use crate::domain::Side;
    use crate::error::VenueError;
    use crate::notify::testing::CapturingNotifier;
    use crate::venue::{MockVenue, Op};

    const NOW: i64 = 1_700_000_000_000;

    struct Rig {
        venue: Arc<MockVenue>,
        ex: Arc<ExchangeClient>,
        watcher: FeedWatcher,
        rx: mpsc::UnboundedReceiver<Trade>,
        latch: BatchReadyLatch,
        notifier: Arc<CapturingNotifier>,
    }

    fn rig() -> Rig {
        let venue = Arc::new(MockVenue::default());
        venue.set_clock(NOW);
        let ex = Arc::new(ExchangeClient::with_retry_delay(venue.clone(), Duration::from_millis(1)));
        let cfg = WatcherCfg {
            symbol: "KRB/UAH".into(),
            target_users: vec!["whale".into(), "shark".into()],
            min_trade_amount: 10.0,
            max_trade_age: Duration::from_secs(60),
            poll_period: Duration::from_secs(10),
            seen_retention: Duration::from_secs(600),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let latch = BatchReadyLatch::new();
        let notifier = Arc::new(CapturingNotifier::default());
        let watcher = FeedWatcher::new(
            ex.clone(),
            cfg,
            StageCfg::default(),
            tx,
            latch.clone(),
            notifier.clone(),
            Journal::disabled(),
        );
        Rig { venue, ex, watcher, rx, latch, notifier }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Trade>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push(t.id);
        }
        out
    }

    #[tokio::test]
    async fn only_target_sized_fresh_trades_are_published() {
        let mut r = rig();
        r.venue.set_trades(vec![
            trade("1", NOW - 1_000, Side::Buy, 50.0, 1.0, "whale"),
            trade("2", NOW - 1_000, Side::Buy, 50.0, 1.0, "minnow"),
            trade("3", NOW - 1_000, Side::Sell, 9.99, 1.0, "shark"),
            trade("4", NOW - 1_000, Side::Sell, 10.0, 1.0, "shark"),
        ]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 2);
        assert_eq!(drain(&mut r.rx), vec!["1", "4"]);
        assert!(r.latch.is_set());
        assert_eq!(r.notifier.order_titles(), vec!["New trade (whale)", "New trade (shark)"]);
    }

    #[tokio::test]
    async fn trades_are_published_oldest_first() {
        let mut r = rig();
        r.venue.set_trades(vec![
            trade("c", NOW - 1_000, Side::Buy, 20.0, 1.0, "whale"),
            trade("a", NOW - 3_000, Side::Buy, 20.0, 1.0, "whale"),
            trade("b", NOW - 2_000, Side::Sell, 20.0, 1.0, "whale"),
        ]);
        r.watcher.poll_once().await.unwrap();
        assert_eq!(drain(&mut r.rx), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn seen_trades_are_never_republished() {
        let mut r = rig();
        let t = trade("7", NOW - 1_000, Side::Buy, 20.0, 1.0, "whale");
        r.venue.set_trades(vec![t.clone()]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 1);

        r.latch.clear();
        r.venue.set_trades(vec![t, trade("8", NOW - 500, Side::Buy, 20.0, 1.0, "whale")]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 1);
        assert_eq!(drain(&mut r.rx), vec!["7", "8"]);
    }

    #[tokio::test]
    async fn evicted_id_served_again_is_stale_not_republished() {
        let mut r = rig();
        let t = trade("7", NOW - 1_000, Side::Buy, 20.0, 1.0, "whale");
        r.venue.set_trades(vec![t.clone()]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 1);

        // past seen_retention: the id is forgotten, the trade itself is long stale
        r.latch.clear();
        r.venue.set_clock(NOW + 601_000);
        r.venue.set_trades(vec![t.clone()]);
        assert_eq!(r.watcher.classify(&t, NOW + 601_000), Class::Ignored);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 0);
        assert_eq!(drain(&mut r.rx), vec!["7"]);
        assert_eq!(r.notifier.order_titles(), vec!["New trade (whale)"]);
        assert!(r.watcher.seen.contains("7"));
    }

    #[tokio::test]
    async fn stale_target_trades_are_marked_seen_but_not_published() {
        let mut r = rig();
        let old = trade("9", NOW - 61_000, Side::Sell, 20.0, 1.0, "whale");
        r.venue.set_trades(vec![old]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 0);
        assert!(drain(&mut r.rx).is_empty());
        assert!(r.watcher.seen.contains("9"));
        assert!(r.notifier.order_titles().is_empty());
        assert!(r.latch.is_set());
    }

    #[tokio::test]
    async fn poll_is_skipped_while_batch_unclaimed() {
        let mut r = rig();
        r.latch.set();
        r.venue.set_trades(vec![trade("1", NOW, Side::Buy, 20.0, 1.0, "whale")]);
        assert_eq!(r.watcher.poll_once().await.unwrap(), 0);
        assert_eq!(r.venue.calls(Op::Trades), 0);
    }

    #[tokio::test]
    async fn fetch_failure_surfaces_as_stage_error() {
        let mut r = rig();
        r.venue.fail_next(Op::Trades, VenueError::Malformed("deals: expected an array".into()));
        assert!(matches!(r.watcher.poll_once().await, Err(StageError::Venue(VenueError::Malformed(_)))));
        assert!(!r.latch.is_set());
    }

    #[test]
    fn retention_evicts_only_old_ids() {
        let mut seen = SeenTrades::new(Duration::from_secs(60));
        seen.insert("old".into(), NOW - 61_000);
        seen.insert("new".into(), NOW - 1_000);
        assert!(!seen.insert("new".into(), NOW - 1_000));
        seen.evict_expired(NOW);
        assert!(!seen.contains("old"));
        assert!(seen.contains("new"));
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn halted_aggregator_does_not_stop_the_watcher() {
        use crate::aggregator::SignalAggregator;
        use crate::config::AggregatorCfg;

        let r = rig();
        let mut watcher = r.watcher;
        for _ in 0..10 {
            r.venue.fail_next(Op::Estimate, VenueError::Rejected("pair disabled".into()));
        }
        // wired like main: the watcher's trade queue is the aggregator's input
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let agg_cfg = AggregatorCfg {
            symbol: "KRB/UAH".into(),
            order_amount_mult: 1.0,
            buy_price_mult: 1.0,
            sell_price_mult: 1.0,
            wash_threshold: 0.2,
        };
        let agg = SignalAggregator::new(
            r.ex.clone(),
            agg_cfg,
            StageCfg { max_consecutive_errors: 10, backoff_base: Duration::ZERO },
            r.rx,
            cmd_tx,
            r.latch.clone(),
            r.notifier.clone(),
            Journal::disabled(),
        );
        let agg_task = tokio::spawn(agg.run());

        for i in 0..10 {
            r.venue.set_trades(vec![trade(&format!("w{i}"), NOW - 1_000, Side::Buy, 20.0, 1.0, "whale")]);
            assert_eq!(watcher.poll_once().await.unwrap(), 1);
            tokio::time::timeout(Duration::from_secs(5), async {
                while r.latch.is_set() {
                    sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        }
        let stopped = tokio::time::timeout(Duration::from_secs(5), agg_task).await.unwrap().unwrap();
        assert_eq!(stopped, Stage::Aggregator);

        // nobody drains the queue or clears the latch any more; polling goes on regardless
        r.venue.set_trades(vec![trade("late1", NOW - 1_000, Side::Buy, 20.0, 1.0, "whale")]);
        assert_eq!(watcher.poll_once().await.unwrap(), 0);
        assert!(watcher.aggregator_gone);
        assert!(r.latch.is_set());
        r.venue.set_trades(vec![trade("late2", NOW - 500, Side::Sell, 20.0, 1.0, "shark")]);
        assert_eq!(watcher.poll_once().await.unwrap(), 0);
        assert_eq!(r.venue.calls(Op::Trades), 12);

        let alerts = r.notifier.alerts();
        assert!(alerts.iter().any(|a| a.starts_with("aggregator") && a.ends_with("Too many errors. Stopping")));
        assert!(!alerts.iter().any(|a| a.starts_with("feed_watcher")));
        assert!(r.notifier.order_titles().ends_with(&["New trade (whale)".to_string(), "New trade (shark)".to_string()]));
    }
}
