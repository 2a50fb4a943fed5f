//! Cancellable pacing delays.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Think time bounds, seconds.
pub const THINK_TIME: (f64, f64) = (1.0, 20.0);
/// Delay between status polls, seconds.
pub const POLLING_DELAY: (f64, f64) = (2.0, 2.25);

/// Sleeps that end early when the test deadline fires.
///
/// Every method returns `false` if the deadline cancelled the sleep, so the
/// caller can bail out at its next checkpoint.
#[derive(Debug, Clone)]
pub struct Pacer {
    enable_delays: bool,
    scale: f64,
    cancel: CancellationToken,
}

impl Pacer {
    pub fn new(enable_delays: bool, scale: f64, cancel: CancellationToken) -> Self {
        Self {
            enable_delays,
            scale,
            cancel,
        }
    }

    /// A pacer whose delays all take zero time. Used by tests.
    pub fn immediate() -> Self {
        Self::new(false, 0.0, CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait exactly `secs` (scaled).
    pub async fn delay(&self, secs: f64) -> bool {
        self.sleep(Duration::from_secs_f64((secs * self.scale).max(0.0)))
            .await
    }

    /// Unscaled seconds in `[min, max]` drawn from `rng`, or `min` when
    /// delays are not randomized.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R, min: f64, max: f64) -> f64 {
        if self.enable_delays && max > min {
            rng.random_range(min..=max)
        } else {
            min
        }
    }

    /// Wait a random time in `[min, max]`, or exactly `min` when delays are
    /// not randomized.
    ///
    /// The caller's generator makes the draw, so a seeded VU paces the same
    /// way on every run.
    pub async fn delay_range<R: Rng + ?Sized>(&self, rng: &mut R, min: f64, max: f64) -> bool {
        let secs = self.draw(rng, min, max);
        trace!("sleepTime={secs}");
        self.delay(secs).await
    }

    pub async fn think<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.delay_range(rng, THINK_TIME.0, THINK_TIME.1).await
    }

    pub async fn polling<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.delay_range(rng, POLLING_DELAY.0, POLLING_DELAY.1).await
    }

    /// Random wait up to `max_secs`, used after server-side trouble.
    pub async fn backoff<R: Rng + ?Sized>(&self, rng: &mut R, ordinal: u32, max_secs: f64) -> bool {
        let secs = rng.random_range(0.0..=max_secs.max(0.0));
        warn!("Backing off VU: {ordinal}, {secs:.1} seconds");
        self.delay(secs).await
    }

    /// Unscaled sleep, cut short by the deadline.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}
