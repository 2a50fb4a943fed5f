//! Session lifecycle: ramp scheduling, pacing and VU termination.

mod pacer;
mod ramp;

pub use pacer::{POLLING_DELAY, Pacer, THINK_TIME};
pub use ramp::{RampError, RampPlan, Stage};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Per-VU view of the ramp plan.
///
/// Once a VU is told to stop it stays stopped, even if asked again later.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    plan: Arc<RampPlan>,
    ordinal: u32,
    test_start: Instant,
    pacer: Pacer,
    stopped: bool,
}

impl Lifecycle {
    pub fn new(plan: Arc<RampPlan>, ordinal: u32, test_start: Instant, pacer: Pacer) -> Self {
        Self {
            plan,
            ordinal,
            test_start,
            pacer,
            stopped: false,
        }
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn elapsed(&self) -> Duration {
        self.test_start.elapsed()
    }

    /// Re-evaluate the ramp schedule for this VU.
    pub fn is_active(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        let elapsed = self.elapsed();
        if self.pacer.is_cancelled() {
            debug!("Test deadline reached for VU: {}", self.ordinal);
            self.stopped = true;
        } else if !self.plan.is_active(self.ordinal, elapsed) {
            info!(
                "Ramping down VU: {}, vusFrac={:.3}, elapsed={:.1}s",
                self.ordinal,
                self.plan.fraction_remaining(elapsed),
                elapsed.as_secs_f64()
            );
            self.stopped = true;
        }
        !self.stopped
    }

    /// Sleep past the end of the test so the VU issues no further requests.
    pub async fn terminate(&self) {
        let remaining = self.plan.remaining(self.elapsed());
        debug!(
            "Terminating VU: {} for {:.1}s",
            self.ordinal,
            remaining.as_secs_f64() * 2.0
        );
        self.pacer.sleep(remaining * 2).await;
    }

    /// Safe checkpoint between dispatch cycles: returns `false` after
    /// terminating the VU if it should no longer run.
    pub async fn checkpoint(&mut self) -> bool {
        if self.is_active() {
            return true;
        }
        self.terminate().await;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn plan() -> Arc<RampPlan> {
        Arc::new(
            RampPlan::new(
                &[
                    Stage::new(Duration::from_secs(10), 10),
                    Stage::new(Duration::from_secs(80), 10),
                    Stage::new(Duration::from_secs(10), 0),
                ],
                10,
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_latched() {
        let pacer = Pacer::new(false, 1.0, CancellationToken::new());
        let mut lifecycle = Lifecycle::new(plan(), 8, Instant::now(), pacer);
        assert!(lifecycle.is_active());
        tokio::time::advance(Duration::from_secs(93)).await;
        assert!(!lifecycle.is_active());
        assert!(!lifecycle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_vu() {
        let cancel = CancellationToken::new();
        let pacer = Pacer::new(false, 1.0, cancel.clone());
        let mut lifecycle = Lifecycle::new(plan(), 1, Instant::now(), pacer);
        assert!(lifecycle.is_active());
        cancel.cancel();
        assert!(!lifecycle.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_sleeps_past_test_end() {
        let pacer = Pacer::new(false, 1.0, CancellationToken::new());
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(plan(), 10, start, pacer);
        tokio::time::advance(Duration::from_secs(95)).await;
        assert!(!lifecycle.checkpoint().await);
        assert!(start.elapsed() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_returns_on_deadline() {
        let cancel = CancellationToken::new();
        let pacer = Pacer::new(false, 1.0, cancel.clone());
        let start = Instant::now();
        let mut lifecycle = Lifecycle::new(plan(), 10, start, pacer);
        tokio::time::advance(Duration::from_secs(95)).await;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert!(!lifecycle.checkpoint().await);
        assert!(start.elapsed() < Duration::from_secs(100));
    }
}
