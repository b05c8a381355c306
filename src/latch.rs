// ===============================
// src/latch.rs
// ===============================
use std::sync::Arc;
use tokio::sync::watch;

/// Level-triggered "batch fetched" flag between the feed watcher and the aggregator.
/// Setting an already-set latch is a no-op: pulses coalesce, the trade queue keeps the data.
#[derive(Clone)]
pub struct BatchReadyLatch {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for BatchReadyLatch {
    fn default() -> Self { Self::new() }
}

impl BatchReadyLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) { self.tx.send_replace(true); }
    pub fn clear(&self) { self.tx.send_replace(false); }
    pub fn is_set(&self) -> bool { *self.tx.borrow() }

    /// Resolves as soon as the latch is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Clears the latch when dropped, whatever way the holder's scope ends.
    pub fn clear_on_drop(&self) -> ClearOnDrop<'_> { ClearOnDrop(self) }
}

pub struct ClearOnDrop<'a>(&'a BatchReadyLatch);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) { self.0.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn repeated_sets_coalesce_into_one_wake() {
        let latch = BatchReadyLatch::new();
        latch.set();
        latch.set();
        timeout(Duration::from_millis(50), latch.wait()).await.unwrap();
        latch.clear();
        assert!(timeout(Duration::from_millis(50), latch.wait()).await.is_err());
    }

    #[tokio::test]
    async fn waiter_wakes_on_later_set() {
        let latch = BatchReadyLatch::new();
        let waiter = {
            let l = latch.clone();
            tokio::spawn(async move { l.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        latch.set();
        timeout(Duration::from_millis(200), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn guard_clears_even_on_early_exit() {
        let latch = BatchReadyLatch::new();
        latch.set();
        let run = || -> Result<(), &'static str> {
            let _g = latch.clear_on_drop();
            Err("boom")
        };
        assert!(run().is_err());
        assert!(!latch.is_set());
    }
}
