use crate::control::Command;
use bias_core::{CycleConfig, Status};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 256;

/// Latest value of every readback exposed to the record layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BiasSnapshot {
    pub voltage: f64,
    pub current_ma: f64,
    pub output_on: bool,
    pub status: Status,
    pub healthy: bool,
    pub cycle_running: bool,
    pub seconds_since_depolarisation: u64,
}

/// Notable transitions, fanned out to the audit log and bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    StatusChanged { from: Status, to: Status },
    CommandHandled { command: Command, accepted: bool },
    RampFinished { target_volts: f64, outcome: String },
    CycleStarted,
    DepolarisationCompleted { repeats: u32 },
    CycleStopped,
    ConfigChanged { config: CycleConfig },
    Fault { message: String },
}

/// Shared readback store. Writers are the poller and control tasks; readers
/// are the bridge, telemetry and tests.
pub struct StateExchange {
    snapshot: Mutex<BiasSnapshot>,
    events: broadcast::Sender<ControlEvent>,
}

impl Default for StateExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl StateExchange {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            snapshot: Mutex::new(BiasSnapshot::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BiasSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read_state(&self) -> BiasSnapshot {
        *self.lock()
    }

    pub fn publish_voltage(&self, voltage: f64) {
        self.lock().voltage = voltage;
    }

    pub fn publish_current(&self, current_ma: f64) {
        self.lock().current_ma = current_ma;
    }

    pub fn publish_output(&self, output_on: bool) {
        self.lock().output_on = output_on;
    }

    pub fn publish_health(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    pub fn publish_elapsed(&self, seconds: u64) {
        self.lock().seconds_since_depolarisation = seconds;
    }

    pub fn set_cycle_running(&self, running: bool) {
        self.lock().cycle_running = running;
    }

    pub fn cycle_running(&self) -> bool {
        self.lock().cycle_running
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Moves to `next`. `Error` is sticky: only [`clear_error`](Self::clear_error)
    /// leaves it. Returns whether the status is now `next`.
    pub fn set_status(&self, next: Status) -> bool {
        let previous = {
            let mut snapshot = self.lock();
            let previous = snapshot.status;
            if previous == Status::Error && next != Status::Error {
                warn!(requested = %next, "Status is ERROR; ignoring transition");
                return false;
            }
            snapshot.status = next;
            previous
        };
        if previous != next {
            info!(from = %previous, to = %next, "Status changed");
            self.emit(ControlEvent::StatusChanged {
                from: previous,
                to: next,
            });
        }
        true
    }

    /// Leaves `Error` after a successful re-initialisation.
    pub fn clear_error(&self) {
        let cleared = {
            let mut snapshot = self.lock();
            if snapshot.status == Status::Error {
                snapshot.status = Status::VoltageOff;
                true
            } else {
                false
            }
        };
        if cleared {
            info!("Error status cleared");
            self.emit(ControlEvent::StatusChanged {
                from: Status::Error,
                to: Status::VoltageOff,
            });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ControlEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
