// ===============================
// src/stage.rs
// ===============================
//
// Failure policy shared by every pipeline stage: count consecutive failed
// cycles, back off between them, and stop the stage once the limit is hit.
// A single successful cycle resets the count.
//
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::error;

use crate::config::StageCfg;
use crate::error::StageError;
use crate::metrics::{STAGE_ALIVE, STAGE_ERRORS};
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FeedWatcher,
    Aggregator,
    Trader,
    PricePoller,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::FeedWatcher => "feed_watcher",
            Stage::Aggregator => "aggregator",
            Stage::Trader => "trader",
            Stage::PricePoller => "price_poller",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retry(Duration),
    Halt,
}

/// base * 2^min(attempt-1, 5) plus up to base/4 of jitter
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(5);
    let base_ms = base.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift) + jitter)
}

pub struct ErrorBudget {
    stage: Stage,
    limit: u32,
    base: Duration,
    consecutive: u32,
}

impl ErrorBudget {
    pub fn new(stage: Stage, cfg: &StageCfg) -> Self {
        STAGE_ALIVE.with_label_values(&[stage.name()]).set(1);
        Self { stage, limit: cfg.max_consecutive_errors.max(1), base: cfg.backoff_base, consecutive: 0 }
    }

    #[cfg(test)]
    pub fn consecutive(&self) -> u32 { self.consecutive }

    pub fn succeeded(&mut self) { self.consecutive = 0; }

    /// Logs and notifies the failure, then decides whether the stage goes on.
    pub fn failed(&mut self, err: &StageError, notifier: &dyn Notifier) -> Verdict {
        self.consecutive += 1;
        STAGE_ERRORS.with_label_values(&[self.stage.name()]).inc();
        error!(stage = %self.stage, consecutive = self.consecutive, error = %err, "stage cycle failed");
        notifier.alert(&format!("{:20}: {}", self.stage.name(), err));

        if self.consecutive >= self.limit {
            error!(stage = %self.stage, "too many errors, stopping");
            notifier.alert(&format!("{:20}: Too many errors. Stopping", self.stage.name()));
            STAGE_ALIVE.with_label_values(&[self.stage.name()]).set(0);
            return Verdict::Halt;
        }
        Verdict::Retry(backoff(self.base, self.consecutive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VenueError;
    use crate::notify::testing::CapturingNotifier;

    fn cfg(limit: u32) -> StageCfg {
        StageCfg { max_consecutive_errors: limit, backoff_base: Duration::from_millis(100) }
    }

    fn boom() -> StageError { StageError::Venue(VenueError::Malformed("x".into())) }

    #[test]
    fn halts_on_the_tenth_consecutive_failure() {
        let n = CapturingNotifier::default();
        let mut b = ErrorBudget::new(Stage::Trader, &cfg(10));
        for _ in 0..9 {
            assert!(matches!(b.failed(&boom(), &n), Verdict::Retry(_)));
        }
        assert_eq!(b.failed(&boom(), &n), Verdict::Halt);
        assert!(n.alerts().last().unwrap().ends_with("Too many errors. Stopping"));
    }

    #[test]
    fn success_resets_the_count() {
        let n = CapturingNotifier::default();
        let mut b = ErrorBudget::new(Stage::Aggregator, &cfg(3));
        b.failed(&boom(), &n);
        b.failed(&boom(), &n);
        b.succeeded();
        assert_eq!(b.consecutive(), 0);
        assert!(matches!(b.failed(&boom(), &n), Verdict::Retry(_)));
        assert!(matches!(b.failed(&boom(), &n), Verdict::Retry(_)));
        assert_eq!(b.failed(&boom(), &n), Verdict::Halt);
    }

    #[test]
    fn backoff_grows_then_caps() {
        let base = Duration::from_millis(100);
        let first = backoff(base, 1);
        assert!(first >= base && first <= Duration::from_millis(125));
        let third = backoff(base, 3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(425));
        let capped = backoff(base, 40);
        assert!(capped >= Duration::from_millis(3200) && capped <= Duration::from_millis(3225));
    }

    #[test]
    fn zero_base_means_no_wait() {
        assert_eq!(backoff(Duration::ZERO, 7), Duration::ZERO);
    }
}
