//! Engine clock
//!
//! All timestamps in the engine are millisecond epochs taken from a single
//! [`Clock`]. The clock anchors a wall-clock epoch to [`tokio::time::Instant`]
//! at construction, so elapsed time follows tokio's clock: under
//! `tokio::time::pause()` the engine's alarms and timestamps advance together
//! with `tokio::time::advance()`.

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

/// Millisecond-epoch clock shared by one engine.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch_ms: i64,
    anchor: Instant,
}

impl Clock {
    /// Create a clock anchored to the current wall-clock time.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self {
            epoch_ms: Utc::now().timestamp_millis(),
            anchor: Instant::now(),
        }
    }

    /// Current time as a millisecond epoch.
    pub fn now_ms(&self) -> i64 {
        self.epoch_ms + self.anchor.elapsed().as_millis() as i64
    }

    /// Current time as a `DateTime<Utc>`.
    pub fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_virtual_time() {
        let clock = Clock::new();
        let before = clock.now_ms();

        tokio::time::advance(Duration::from_secs(30)).await;

        let after = clock.now_ms();
        assert_eq!(after - before, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_the_anchor() {
        let clock = Clock::new();
        let cloned = clock.clone();

        tokio::time::advance(Duration::from_millis(250)).await;

        assert_eq!(clock.now_ms(), cloned.now_ms());
    }
}
