// ===============================
// src/clock.rs
// ===============================
//
// Wall-clock aligned waits: loops resume on epoch-aligned boundaries
// (e.g. every :00, :10, :20 s) rather than after a fixed sleep.
//
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::sleep;

/// Time until the next boundary strictly after `now`.
pub fn until_next_slot(now: DateTime<Utc>, period: Duration) -> Duration {
    let p = (period.as_millis() as i64).max(1);
    let rem = now.timestamp_millis().rem_euclid(p);
    Duration::from_millis((p - rem) as u64)
}

/// Like `until_next_slot`, but never lands on second 0 of a minute.
pub fn until_next_slot_off_minute(now: DateTime<Utc>, period: Duration) -> Duration {
    let mut wait = until_next_slot(now, period);
    loop {
        let at_ms = now.timestamp_millis() + wait.as_millis() as i64;
        if at_ms.rem_euclid(60_000) >= 1_000 || wait > Duration::from_secs(120) {
            return wait;
        }
        wait += period.max(Duration::from_millis(1));
    }
}

pub async fn sleep_until_slot(period: Duration) {
    sleep(until_next_slot(Utc::now(), period)).await
}

pub async fn sleep_until_slot_off_minute(period: Duration) {
    sleep(until_next_slot_off_minute(Utc::now(), period)).await
}
