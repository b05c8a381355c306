// ===============================
// src/prices.rs
// ===============================
//
// Market price poller: read-only monitor. Every clock slot (never on second 0)
// ask the venue what a fixed notional would average on each side, log it and
// export it as a gauge. Nothing is kept between samples.
//
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::clock;
use crate::config::{PollerCfg, StageCfg};
use crate::domain::Side;
use crate::error::StageError;
use crate::exchange::ExchangeClient;
use crate::metrics::MARKET_PRICE;
use crate::notify::Notifier;
use crate::stage::{ErrorBudget, Stage, Verdict};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketPrices {
    pub buy: f64,
    pub sell: f64,
}

pub struct MarketPricePoller {
    ex: Arc<ExchangeClient>,
    cfg: PollerCfg,
    stage_cfg: StageCfg,
    notifier: Arc<dyn Notifier>,
}

impl MarketPricePoller {
    pub fn new(ex: Arc<ExchangeClient>, cfg: PollerCfg, stage_cfg: StageCfg, notifier: Arc<dyn Notifier>) -> Self {
        Self { ex, cfg, stage_cfg, notifier }
    }

    async fn average(&self, side: Side) -> Result<f64, StageError> {
        let est = self.ex.estimate_execution_price(side, &self.cfg.symbol, self.cfg.notional).await?;
        let avg = est.average(self.cfg.notional);
        if self.cfg.notional <= 0.0 || !avg.is_finite() || avg <= 0.0 {
            return Err(StageError::Arithmetic(format!("{side} estimate total {} for {}", est.total, self.cfg.notional)));
        }
        Ok(avg)
    }

    pub async fn sample(&self) -> Result<MarketPrices, StageError> {
        let buy = self.average(Side::Buy).await?;
        let sell = self.average(Side::Sell).await?;

        info!("Market prices [BUY: {:.8} SELL: {:.8}]", buy, sell);
        MARKET_PRICE.with_label_values(&[Side::Buy.as_str()]).set(buy);
        MARKET_PRICE.with_label_values(&[Side::Sell.as_str()]).set(sell);
        Ok(MarketPrices { buy, sell })
    }

    pub async fn run(self) -> Stage {
        let mut budget = ErrorBudget::new(Stage::PricePoller, &self.stage_cfg);
        info!(symbol = %self.cfg.symbol, notional = self.cfg.notional, "price poller started");
        loop {
            match self.sample().await {
                Ok(_) => {
                    budget.succeeded();
                    clock::sleep_until_slot_off_minute(self.cfg.period).await;
                }
                Err(e) => match budget.failed(&e, self.notifier.as_ref()) {
                    Verdict::Retry(d) => sleep(d).await,
                    Verdict::Halt => {
                        warn!("price poller stopped");
                        return Stage::PricePoller;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VenueError;
    use crate::notify::testing::CapturingNotifier;
    use crate::venue::{MockVenue, Op};
    use std::time::Duration;

    fn poller(venue: Arc<MockVenue>, notional: f64, stage_cfg: StageCfg) -> (MarketPricePoller, Arc<CapturingNotifier>) {
        let ex = Arc::new(ExchangeClient::with_retry_delay(venue, Duration::from_millis(1)));
        let cfg = PollerCfg { symbol: "KRB/UAH".into(), notional, period: Duration::from_secs(3) };
        let notifier = Arc::new(CapturingNotifier::default());
        (MarketPricePoller::new(ex, cfg, stage_cfg, notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn sample_reports_average_per_side() {
        let venue = Arc::new(MockVenue::new(2.5));
        let (p, _) = poller(venue.clone(), 1000.0, StageCfg::default());
        assert_eq!(p.sample().await.unwrap(), MarketPrices { buy: 2.5, sell: 2.5 });
        assert_eq!(venue.calls(Op::Estimate), 2);
    }

    #[tokio::test]
    async fn zero_notional_is_an_arithmetic_error() {
        let (p, _) = poller(Arc::new(MockVenue::default()), 0.0, StageCfg::default());
        assert!(matches!(p.sample().await, Err(StageError::Arithmetic(_))));
    }

    #[tokio::test]
    async fn network_blips_are_invisible() {
        let venue = Arc::new(MockVenue::new(4.0));
        venue.fail_next(Op::Estimate, VenueError::Network("reset by peer".into()));
        let (p, notifier) = poller(venue.clone(), 10.0, StageCfg::default());
        assert_eq!(p.sample().await.unwrap().buy, 4.0);
        assert!(notifier.alerts().is_empty());
    }

    #[tokio::test]
    async fn ten_failed_samples_stop_the_poller() {
        let venue = Arc::new(MockVenue::default());
        for _ in 0..10 {
            venue.fail_next(Op::Estimate, VenueError::Http { status: 403, body: "forbidden".into() });
        }
        let stage_cfg = StageCfg { max_consecutive_errors: 10, backoff_base: Duration::ZERO };
        let (p, notifier) = poller(venue, 10.0, stage_cfg);
        let stopped = tokio::time::timeout(Duration::from_secs(5), p.run()).await.unwrap();
        assert_eq!(stopped, Stage::PricePoller);
        assert_eq!(notifier.alerts().len(), 11);
    }
}
