//! Ramp, cycle and polling tasks plus the command front-end that owns them.

pub mod controller;
pub mod cycle;
pub mod poller;
pub mod ramp;

pub use controller::{run_commands, BiasController, Command};
pub use cycle::{CycleController, CycleExit};
pub use poller::{PollSample, Poller, POLL_INTERVAL};
pub use ramp::{RampEngine, RampOutcome};

use crate::metrics::FAULTS;
use crate::state::{ControlEvent, StateExchange};
use bias_core::{AbortToken, Status};
use std::time::Duration;
use tokio::time::Instant;
use tracing::error;

/// Longest a hold goes without looking at its abort token.
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sleeps for `duration` unless `token` trips first. Returns `false` when
/// aborted.
pub async fn hold(duration: Duration, token: &AbortToken) -> bool {
    let Some(deadline) = Instant::now().checked_add(duration) else {
        hold_until_aborted(token).await;
        return false;
    };
    loop {
        if token.is_triggered() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(ABORT_POLL_INTERVAL)).await;
    }
}

pub async fn hold_until_aborted(token: &AbortToken) {
    while !token.is_triggered() {
        tokio::time::sleep(ABORT_POLL_INTERVAL).await;
    }
}

/// Seconds from configuration as a sleep duration. Negative means zero.
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// Unexpected failure inside an operation: `Status::Error` until re-initialised.
pub fn enter_error(exchange: &StateExchange, err: &dyn std::error::Error) {
    error!(error = %err, "Operation failed; entering ERROR");
    FAULTS.inc();
    exchange.set_cycle_running(false);
    exchange.publish_health(false);
    exchange.set_status(Status::Error);
    exchange.emit(ControlEvent::Fault {
        message: err.to_string(),
    });
}
