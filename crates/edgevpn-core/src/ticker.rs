//! Exponential backoff ticker. Periodic loops (announce, synchronizer,
//! discovery refresh) start fast and settle at their configured
//! interval, so a freshly joined node converges quickly without
//! hammering the network forever.

use std::time::Duration;

use rand::Rng;

/// Ticker whose period grows exponentially from `initial` up to a cap.
pub struct BackoffTicker {
    current: Duration,
    initial: Duration,
    max: Duration,
    multiplier: f64,
    randomization: f64,
}

impl BackoffTicker {
    /// A ticker capped at `max` with the default growth curve
    /// (5s initial, factor 2, ±50% jitter).
    pub fn capped(max: Duration) -> Self {
        let initial = Duration::from_secs(5).min(max);
        Self {
            current: initial,
            initial,
            max,
            multiplier: 2.0,
            randomization: 0.5,
        }
    }

    /// Next wait period: the current interval with jitter applied,
    /// advancing the underlying interval toward the cap.
    pub fn next_interval(&mut self) -> Duration {
        let base = self.current;
        let grown = base.mul_f64(self.multiplier);
        self.current = if grown > self.max { self.max } else { grown };

        if self.randomization <= 0.0 {
            return base;
        }
        let delta = base.mul_f64(self.randomization);
        let low = base.saturating_sub(delta);
        let span = (base + delta).saturating_sub(low);
        low + span.mul_f64(rand::thread_rng().gen::<f64>())
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        tokio::time::sleep(self.next_interval()).await;
    }

    /// Reset back to the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
