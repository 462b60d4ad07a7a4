//! Stepped voltage ramp arithmetic.
//!
//! A [`RampSpec`] describes where to go and how fast; [`RampSpec::plan`]
//! turns it into the concrete list of setpoints and the pause between them
//! once the present voltage is known. Execution lives with the instrument
//! driver; this module never touches the wire.

use std::time::Duration;

/// Highest rate at which discrete voltage steps are issued to the instrument.
pub const MAX_RATE_HZ: f64 = 20.0;

/// Subtracted from every step interval to offset the set/readback exchange.
pub const LOOP_OVERHEAD: Duration = Duration::from_millis(10);

/// One requested ramp. Built per invocation and consumed once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampSpec {
    pub target_volts: f64,
    pub step_volts: f64,
    pub duration_seconds: f64,
}

/// Concrete step sequence for a ramp starting at a known voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampPlan {
    start: f64,
    target: f64,
    steps: u32,
    step_size: f64,
    interval: Duration,
}

impl RampSpec {
    pub fn new(target_volts: f64, step_volts: f64, duration_seconds: f64) -> Self {
        Self {
            target_volts,
            step_volts,
            duration_seconds,
        }
    }

    /// Target with the bias sign policy applied: always non-positive.
    pub fn target(&self) -> f64 {
        -self.target_volts.abs() + 0.0
    }

    /// False for zero, negative or non-finite durations.
    pub fn has_duration(&self) -> bool {
        self.duration_seconds.is_finite() && self.duration_seconds > 0.0
    }

    /// Plans the ramp from `current_volts`.
    ///
    /// Returns `None` when there is nothing to do: no duration, or already
    /// at the target.
    pub fn plan(&self, current_volts: f64) -> Option<RampPlan> {
        if !self.has_duration() || !current_volts.is_finite() {
            return None;
        }
        let target = self.target();
        let difference = target - current_volts;
        if difference == 0.0 || !difference.is_finite() {
            return None;
        }

        let requested = if self.step_volts.is_finite() && self.step_volts != 0.0 {
            (difference / self.step_volts).abs().round()
        } else {
            f64::INFINITY
        };

        let mut steps = requested;
        if steps / self.duration_seconds > MAX_RATE_HZ {
            steps = (self.duration_seconds * MAX_RATE_HZ).floor();
            log::debug!(
                "ramp of {difference} V over {} s clamped from {requested} to {steps} steps",
                self.duration_seconds
            );
        }
        // Shorter than one update period, or a difference below half a step:
        // a single step straight to the target.
        let steps = steps.clamp(1.0, u32::MAX as f64) as u32;

        let step_size = difference / steps as f64;
        let interval_s = (self.duration_seconds / steps as f64 - LOOP_OVERHEAD.as_secs_f64()).max(0.0);
        let interval = Duration::try_from_secs_f64(interval_s).unwrap_or(Duration::MAX);

        Some(RampPlan {
            start: current_volts,
            target,
            steps,
            step_size,
            interval,
        })
    }
}

impl RampPlan {
    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    /// Pause after each step, already reduced by [`LOOP_OVERHEAD`].
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Setpoints for step `0..=steps`. The first is the start voltage and the
    /// last is exactly the target.
    pub fn setpoints(&self) -> impl Iterator<Item = f64> + '_ {
        (0..=self.steps).map(move |i| {
            if i == self.steps {
                self.target
            } else {
                self.start + self.step_size * i as f64
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_requested_step_count_within_rate() {
        let plan = RampSpec::new(500.0, 5.0, 10.0).plan(0.0).unwrap();
        assert_eq!(plan.steps(), 100);
        assert_eq!(plan.step_size(), -5.0);
        assert_eq!(plan.target(), -500.0);
        assert!((plan.interval().as_secs_f64() - 0.09).abs() < 1e-6);
    }

    #[test]
    fn clamps_to_max_rate() {
        let plan = RampSpec::new(500.0, 1.0, 1.0).plan(0.0).unwrap();
        assert_eq!(plan.steps(), 20);
        assert_eq!(plan.step_size(), -25.0);
    }

    #[test]
    fn no_plan_without_difference_or_duration() {
        assert!(RampSpec::new(300.0, 5.0, 2.0).plan(-300.0).is_none());
        assert!(RampSpec::new(300.0, 5.0, 0.0).plan(0.0).is_none());
        assert!(RampSpec::new(300.0, 5.0, -1.0).plan(0.0).is_none());
        assert!(RampSpec::new(300.0, 5.0, f64::NAN).plan(0.0).is_none());
    }

    #[test]
    fn target_sign_is_forced_negative() {
        let positive = RampSpec::new(300.0, 5.0, 1.0);
        let negative = RampSpec::new(-300.0, 5.0, 1.0);
        assert_eq!(positive.target(), -300.0);
        assert_eq!(positive.target(), negative.target());
        assert_eq!(RampSpec::new(0.0, 5.0, 1.0).target().to_bits(), 0.0f64.to_bits());
    }

    #[test]
    fn last_setpoint_lands_on_target() {
        let plan = RampSpec::new(333.3, 7.0, 3.0).plan(0.0).unwrap();
        let setpoints: Vec<f64> = plan.setpoints().collect();
        assert_eq!(setpoints.len(), plan.steps() as usize + 1);
        assert_eq!(setpoints[0], 0.0);
        assert_eq!(*setpoints.last().unwrap(), -333.3);
    }

    #[test]
    fn ramp_back_towards_zero() {
        let plan = RampSpec::new(0.0, 50.0, 1.0).plan(-500.0).unwrap();
        assert_eq!(plan.steps(), 10);
        assert_eq!(plan.step_size(), 50.0);
        assert_eq!(plan.setpoints().last(), Some(0.0));
    }

    #[test]
    fn very_short_ramp_is_a_single_step() {
        let plan = RampSpec::new(100.0, 1.0, 0.005).plan(0.0).unwrap();
        assert_eq!(plan.steps(), 1);
        assert_eq!(plan.interval(), Duration::ZERO);
        assert_eq!(plan.setpoints().collect::<Vec<_>>(), vec![0.0, -100.0]);
    }

    #[test]
    fn zero_step_size_uses_max_rate() {
        let plan = RampSpec::new(100.0, 0.0, 2.0).plan(0.0).unwrap();
        assert_eq!(plan.steps(), 40);
    }
}
