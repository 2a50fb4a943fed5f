//! Ramp plan: when each VU starts and when it must stop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One ramp stage: move linearly to `target` VUs over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RampError {
    #[error("Ramp plan needs at least {min} stages, got {got}")]
    TooFewStages { min: usize, got: usize },
    #[error("Ramp-down stage has zero duration")]
    EmptyRampDown,
    #[error("Max concurrency must be at least 1")]
    NoConcurrency,
}

/// Derived timing for a whole test run.
///
/// The last stage is the ramp-down window. During it, the fraction of VUs
/// allowed to stay active falls linearly from 1 to 0.
#[derive(Debug, Clone)]
pub struct RampPlan {
    stages: Vec<Stage>,
    test_duration: Duration,
    ramp_down_start: Duration,
    ramp_down_duration: Duration,
    max_concurrency: u32,
}

impl RampPlan {
    pub const MIN_STAGES: usize = 3;

    pub fn new(stages: &[Stage], max_concurrency: u32) -> Result<Self, RampError> {
        if stages.len() < Self::MIN_STAGES {
            return Err(RampError::TooFewStages {
                min: Self::MIN_STAGES,
                got: stages.len(),
            });
        }
        if max_concurrency == 0 {
            return Err(RampError::NoConcurrency);
        }
        let test_duration: Duration = stages.iter().map(|s| s.duration).sum();
        let ramp_down_duration = stages[stages.len() - 1].duration;
        if ramp_down_duration.is_zero() {
            return Err(RampError::EmptyRampDown);
        }
        Ok(Self {
            stages: stages.to_vec(),
            test_duration,
            ramp_down_start: test_duration - ramp_down_duration,
            ramp_down_duration,
            max_concurrency,
        })
    }

    pub fn test_duration(&self) -> Duration {
        self.test_duration
    }

    pub fn ramp_down_start(&self) -> Duration {
        self.ramp_down_start
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    /// Fraction of VUs still allowed to run at `elapsed`.
    pub fn fraction_remaining(&self, elapsed: Duration) -> f64 {
        if elapsed <= self.ramp_down_start {
            return 1.0;
        }
        let into_ramp_down = (elapsed - self.ramp_down_start).as_secs_f64();
        (1.0 - into_ramp_down / self.ramp_down_duration.as_secs_f64()).max(0.0)
    }

    /// Whether the VU with 1-based `ordinal` may keep running at `elapsed`.
    pub fn is_active(&self, ordinal: u32, elapsed: Duration) -> bool {
        f64::from(ordinal) <= self.fraction_remaining(elapsed) * f64::from(self.max_concurrency)
    }

    /// Time left until the end of the test.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.test_duration.saturating_sub(elapsed)
    }

    /// Offset from test start at which the ramp-up first reaches `ordinal`.
    ///
    /// Returns `None` for ordinals no stage ever reaches.
    pub fn start_offset(&self, ordinal: u32) -> Option<Duration> {
        let mut offset = Duration::ZERO;
        let mut current = 0u32;
        for stage in &self.stages {
            if stage.target >= ordinal && current < ordinal {
                let span = f64::from(stage.target - current);
                let progress = f64::from(ordinal - current) / span;
                return Some(offset + stage.duration.mul_f64(progress));
            }
            offset += stage.duration;
            current = stage.target;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// 300s ramp-down starting at 600s, 100 VUs.
    fn example_plan() -> RampPlan {
        RampPlan::new(
            &[
                Stage::new(secs(100), 100),
                Stage::new(secs(500), 100),
                Stage::new(secs(300), 0),
            ],
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_everyone_active_before_ramp_down() {
        let plan = example_plan();
        assert_eq!(plan.ramp_down_start(), secs(600));
        for ordinal in [1, 50, 100] {
            assert!(plan.is_active(ordinal, secs(0)));
            assert!(plan.is_active(ordinal, secs(600)));
        }
    }

    #[test]
    fn test_half_way_through_ramp_down() {
        let plan = example_plan();
        assert!((plan.fraction_remaining(secs(750)) - 0.5).abs() < 1e-9);
        assert!(plan.is_active(40, secs(750)));
        assert!(!plan.is_active(60, secs(750)));
    }

    #[test]
    fn test_fraction_clamped_after_end() {
        let plan = example_plan();
        assert_eq!(plan.fraction_remaining(secs(900)), 0.0);
        assert_eq!(plan.fraction_remaining(secs(5000)), 0.0);
        assert!(!plan.is_active(1, secs(901)));
    }

    #[test]
    fn test_stop_decision_is_monotonic() {
        let plan = example_plan();
        for ordinal in 1..=100 {
            let mut stopped = false;
            for t in (0..=1000).step_by(5) {
                let active = plan.is_active(ordinal, secs(t));
                if stopped {
                    assert!(!active, "VU {ordinal} reactivated at {t}s");
                }
                stopped |= !active;
            }
            assert!(stopped);
        }
    }

    #[test]
    fn test_start_offsets_follow_ramp_up() {
        let plan = example_plan();
        assert_eq!(plan.start_offset(1), Some(secs(1)));
        assert_eq!(plan.start_offset(50), Some(secs(50)));
        assert_eq!(plan.start_offset(100), Some(secs(100)));
        assert_eq!(plan.start_offset(101), None);
    }

    #[test]
    fn test_start_offset_across_stepped_stages() {
        let plan = RampPlan::new(
            &[
                Stage::new(secs(10), 10),
                Stage::new(secs(20), 30),
                Stage::new(secs(10), 0),
            ],
            30,
        )
        .unwrap();
        assert_eq!(plan.start_offset(10), Some(secs(10)));
        assert_eq!(plan.start_offset(20), Some(secs(20)));
        assert_eq!(plan.start_offset(30), Some(secs(30)));
    }

    #[test]
    fn test_rejects_bad_plans() {
        assert_eq!(
            RampPlan::new(&[Stage::new(secs(1), 1)], 1).unwrap_err(),
            RampError::TooFewStages { min: 3, got: 1 }
        );
        let stages = [
            Stage::new(secs(1), 1),
            Stage::new(secs(1), 1),
            Stage::new(secs(0), 0),
        ];
        assert_eq!(RampPlan::new(&stages, 1).unwrap_err(), RampError::EmptyRampDown);
        let stages = [
            Stage::new(secs(1), 1),
            Stage::new(secs(1), 1),
            Stage::new(secs(1), 0),
        ];
        assert_eq!(RampPlan::new(&stages, 0).unwrap_err(), RampError::NoConcurrency);
    }

    #[test]
    fn test_remaining_saturates() {
        let plan = example_plan();
        assert_eq!(plan.test_duration(), secs(900));
        assert_eq!(plan.remaining(secs(850)), secs(50));
        assert_eq!(plan.remaining(secs(1000)), Duration::ZERO);
    }
}
