//! Fixed-rate pacing tokens.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Mints one token per period; at most one unused token is banked.
///
/// The first token is available immediately.
#[derive(Debug)]
pub struct Pacer {
    interval: Interval,
}

impl Pacer {
    /// Creates a pacer minting `rate` tokens per second.
    #[must_use]
    pub fn per_second(rate: u32) -> Self {
        Self::with_period(Duration::from_secs(1) / rate.max(1))
    }

    /// Creates a pacer minting one token every `period`.
    #[must_use]
    pub fn with_period(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period.max(Duration::from_nanos(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }

    /// Returns the token period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Waits for the next token.
    ///
    /// Returns `false` without consuming a token if `shutdown` fires first.
    pub async fn acquire(&mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}
