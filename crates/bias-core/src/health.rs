/// Bias is on and sitting exactly at the operating setpoint.
///
/// Exact comparison: the instrument echoes the programmed value, so any
/// difference means a ramp is in progress or the setpoint changed.
pub fn is_healthy(output_on: bool, voltage: f64, on_setpoint: f64) -> bool {
    output_on && voltage.abs() == on_setpoint.abs()
}

/// Readback equals the (negated) depolarising setpoint.
pub fn at_off_setpoint(voltage: f64, off_setpoint: f64) -> bool {
    voltage == -off_setpoint.abs()
}

/// Seconds since the bias last sat at the off setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepolarisationTimer {
    last_reset_s: f64,
}

impl DepolarisationTimer {
    pub fn new(now_s: f64) -> Self {
        Self { last_reset_s: now_s }
    }

    pub fn reset(&mut self, now_s: f64) {
        self.last_reset_s = now_s;
    }

    pub fn elapsed_s(&self, now_s: f64) -> f64 {
        (now_s - self.last_reset_s).max(0.0)
    }

    /// Whole seconds, as exposed on the record layer.
    pub fn elapsed_whole_s(&self, now_s: f64) -> u64 {
        self.elapsed_s(now_s).floor() as u64
    }
}

/// Decides when an overdue depolarisation should be requested.
///
/// Fires once per overdue period, and only while the supply is `ready`:
/// idle, output on and settled at ON. Being overdue while not ready disarms
/// the trigger, and it only re-arms after the elapsed counter drops below
/// the ceiling again. An operator Stop or output-off is never undone by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxTimeTrigger {
    armed: bool,
}

impl Default for MaxTimeTrigger {
    fn default() -> Self {
        Self { armed: true }
    }
}

impl MaxTimeTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Returns true when a depolarisation should be requested now.
    /// A non-positive `max_time_s` disables the trigger.
    pub fn poll(&mut self, elapsed_s: f64, max_time_s: f64, ready: bool) -> bool {
        if max_time_s.is_nan() || max_time_s <= 0.0 {
            return false;
        }
        if elapsed_s < max_time_s {
            self.armed = true;
            return false;
        }
        if !ready {
            self.armed = false;
            return false;
        }
        if self.armed {
            self.armed = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_needs_output_and_exact_magnitude() {
        assert!(is_healthy(true, -500.0, 500.0));
        assert!(is_healthy(true, -500.0, -500.0));
        assert!(!is_healthy(false, -500.0, 500.0));
        assert!(!is_healthy(true, -499.9, 500.0));
        assert!(!is_healthy(true, 0.0, 500.0));
    }

    #[test]
    fn off_setpoint_match_is_signed() {
        assert!(at_off_setpoint(0.0, 0.0));
        assert!(at_off_setpoint(-10.0, 10.0));
        assert!(!at_off_setpoint(10.0, 10.0));
    }

    #[test]
    fn timer_counts_from_reset() {
        let mut timer = DepolarisationTimer::new(10.0);
        assert_eq!(timer.elapsed_whole_s(12.7), 2);
        timer.reset(20.0);
        assert_eq!(timer.elapsed_s(19.0), 0.0);
        assert_eq!(timer.elapsed_whole_s(25.0), 5);
    }

    #[test]
    fn trigger_fires_once_per_overdue_period() {
        let mut trigger = MaxTimeTrigger::new();
        assert!(!trigger.poll(10.0, 60.0, true));
        assert!(trigger.poll(60.0, 60.0, true));
        assert!(!trigger.poll(61.0, 60.0, true));
        assert!(!trigger.poll(5.0, 60.0, true));
        assert!(trigger.poll(70.0, 60.0, true));
    }

    #[test]
    fn trigger_disarmed_while_not_ready() {
        let mut trigger = MaxTimeTrigger::new();
        assert!(!trigger.poll(100.0, 60.0, false));
        assert!(!trigger.is_armed());
        // Ready again while still overdue: stays quiet.
        assert!(!trigger.poll(101.0, 60.0, true));
        assert!(!trigger.poll(0.0, 60.0, true));
        assert!(trigger.poll(60.0, 60.0, true));
    }

    #[test]
    fn zero_max_time_disables_trigger() {
        let mut trigger = MaxTimeTrigger::new();
        assert!(!trigger.poll(1e9, 0.0, true));
        assert!(!trigger.poll(1e9, f64::NAN, true));
    }
}
