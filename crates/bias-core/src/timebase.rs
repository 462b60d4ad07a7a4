use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Process clock: monotonic time since start plus wall-clock stamps for logs.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }

    /// Monotonic microseconds since start.
    pub fn now_us(&self) -> u64 {
        self.uptime().as_micros() as u64
    }

    /// Wall-clock microseconds since the Unix epoch. Audit records only.
    pub fn unix_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}
