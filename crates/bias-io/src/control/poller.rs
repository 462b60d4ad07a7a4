use super::Command;
use crate::driver::{Keithley, SharedInstrument};
use crate::error::DriverResult;
use crate::metrics::READBACK_FAILURES;
use crate::state::StateExchange;
use bias_core::{
    at_off_setpoint, is_healthy, AbortToken, DepolarisationTimer, MaxTimeTrigger,
    SharedCycleConfig, Status,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 2 Hz readback cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What one poll saw. `None` readbacks failed and were skipped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSample {
    pub voltage: Option<f64>,
    pub current_ma: Option<f64>,
    pub output_on: Option<bool>,
    pub healthy: bool,
    pub seconds_since_depolarisation: u64,
    pub depolarise_requested: bool,
}

pub struct Poller {
    instrument: SharedInstrument,
    config: SharedCycleConfig,
    exchange: Arc<StateExchange>,
    interval: Duration,
    origin: Instant,
    timer: DepolarisationTimer,
    trigger: MaxTimeTrigger,
    commands: Option<mpsc::Sender<Command>>,
}

impl Poller {
    pub fn new(instrument: SharedInstrument, config: SharedCycleConfig, exchange: Arc<StateExchange>) -> Self {
        Self {
            instrument,
            config,
            exchange,
            interval: POLL_INTERVAL,
            origin: Instant::now(),
            timer: DepolarisationTimer::new(0.0),
            trigger: MaxTimeTrigger::new(),
            commands: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Where the max-time trigger sends its `Depolarise` request.
    pub fn with_commands(mut self, commands: mpsc::Sender<Command>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub async fn run(mut self, shutdown: AbortToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !shutdown.is_triggered() {
            ticker.tick().await;
            self.poll_once().await;
        }
        info!("Poller stopped");
    }

    pub async fn poll_once(&mut self) -> PollSample {
        let voltage = {
            let mut instrument = self.instrument.lock().await;
            let reading = instrument.get_voltage().await;
            readback("voltage", reading, &instrument)
        };
        let current_ma = {
            let mut instrument = self.instrument.lock().await;
            let reading = instrument.get_current().await;
            readback("current", reading, &instrument)
        };
        let output_on = {
            let mut instrument = self.instrument.lock().await;
            let reading = instrument.get_source_status().await;
            readback("output", reading, &instrument)
        };

        let config = self.config.snapshot();
        if let Some(v) = voltage {
            self.exchange.publish_voltage(v);
        }
        if let Some(ma) = current_ma {
            self.exchange.publish_current(ma);
        }
        if let Some(on) = output_on {
            self.exchange.publish_output(on);
        }

        let healthy = match (output_on, voltage) {
            (Some(on), Some(v)) => is_healthy(on, v, config.on_setpoint),
            _ => false,
        };
        self.exchange.publish_health(healthy);

        let now = self.origin.elapsed().as_secs_f64();
        if voltage.is_some_and(|v| at_off_setpoint(v, config.off_setpoint)) {
            self.timer.reset(now);
        }
        let seconds_since_depolarisation = self.timer.elapsed_whole_s(now);
        self.exchange.publish_elapsed(seconds_since_depolarisation);

        let ready = self.ready_for_depolarisation(output_on);
        let depolarise_requested =
            self.trigger
                .poll(self.timer.elapsed_s(now), config.max_time, ready);
        if depolarise_requested {
            self.request_depolarisation(seconds_since_depolarisation);
        }

        PollSample {
            voltage,
            current_ma,
            output_on,
            healthy,
            seconds_since_depolarisation,
            depolarise_requested,
        }
    }

    /// Idle, output confirmed on and settled at ON.
    fn ready_for_depolarisation(&self, output_on: Option<bool>) -> bool {
        output_on == Some(true)
            && !self.exchange.cycle_running()
            && self.exchange.status() == Status::VoltageOn
    }

    fn request_depolarisation(&self, elapsed: u64) {
        let Some(commands) = &self.commands else {
            debug!(elapsed_s = elapsed, "Max time exceeded; no command channel");
            return;
        };
        info!(elapsed_s = elapsed, "Max time since depolarisation exceeded; requesting cycle");
        if let Err(err) = commands.try_send(Command::Depolarise) {
            warn!(error = %err, "Could not queue depolarise request");
        }
    }
}

fn readback<T>(what: &'static str, reading: DriverResult<T>, instrument: &Keithley) -> Option<T> {
    match reading {
        Ok(value) => Some(value),
        Err(err) => {
            READBACK_FAILURES.inc();
            if err.is_readback_failure() {
                warn!(
                    readback = what,
                    error = %err,
                    last_response = %instrument.last_response(),
                    "Readback skipped"
                );
            } else {
                error!(readback = what, error = %err, "Readback failed");
            }
            None
        }
    }
}
