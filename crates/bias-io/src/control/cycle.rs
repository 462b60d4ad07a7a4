use super::{enter_error, hold, hold_until_aborted, seconds, RampEngine};
use crate::error::DriverResult;
use crate::metrics::{CYCLES_STARTED, DEPOLARISATIONS_COMPLETED};
use crate::state::{ControlEvent, StateExchange};
use bias_core::{AbortToken, CycleConfig, RampSpec, SharedCycleConfig, Status};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument};

/// How a cycle ended without failing. The loop only ends on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleExit {
    Aborted { depolarisations: u64 },
}

/// Depolarisation state machine.
///
/// One batch is `repeats` passes of ON hold, ramp to off, OFF hold, ramp to
/// on. Between batches the bias stays ON until `max_time` has passed since
/// the last completed batch. Configuration is read when each phase starts.
pub struct CycleController {
    engine: RampEngine,
    config: SharedCycleConfig,
    exchange: Arc<StateExchange>,
    last_depolarisation: Mutex<Option<Instant>>,
}

impl CycleController {
    pub fn new(engine: RampEngine, config: SharedCycleConfig, exchange: Arc<StateExchange>) -> Self {
        Self {
            engine,
            config,
            exchange,
            last_depolarisation: Mutex::new(None),
        }
    }

    pub fn last_depolarisation(&self) -> Option<Instant> {
        *self
            .last_depolarisation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs until `token` trips (`Ok`) or an exchange fails (`Err`, status
    /// left at `Error`).
    #[instrument(skip_all)]
    pub async fn run(&self, token: &AbortToken) -> DriverResult<CycleExit> {
        self.exchange.set_cycle_running(true);
        CYCLES_STARTED.inc();
        self.exchange.emit(ControlEvent::CycleStarted);
        info!("Depolarisation cycle started");

        let mut depolarisations = 0;
        let result = self.run_batches(token, &mut depolarisations).await;
        self.exchange.set_cycle_running(false);

        match result {
            Ok(()) => {
                self.exchange.set_status(Status::Hold);
                self.exchange.emit(ControlEvent::CycleStopped);
                info!(depolarisations, "Depolarisation cycle stopped");
                Ok(CycleExit::Aborted { depolarisations })
            }
            Err(err) => {
                enter_error(&self.exchange, &err);
                Err(err)
            }
        }
    }

    async fn run_batches(&self, token: &AbortToken, completed: &mut u64) -> DriverResult<()> {
        let reference = Instant::now();

        // Every cycle starts from a known ON state.
        if !self.ramp_phase(Status::RampDown, CycleConfig::ramp_to_on, token).await? {
            return Ok(());
        }

        loop {
            let repeats = self.config.snapshot().repeats;
            for repeat in 1..=repeats {
                tracing::debug!(repeat, repeats, "Depolarisation pass");
                let on_hold = self.on_hold_duration(reference);
                if !self.hold_phase(Status::VoltageOn, on_hold, token).await {
                    return Ok(());
                }
                self.exchange.publish_health(false);
                if !self.ramp_phase(Status::RampUp, CycleConfig::ramp_to_off, token).await? {
                    return Ok(());
                }
                let off_hold = self.config.snapshot().hold_time;
                if !self.hold_phase(Status::VoltageOff, Some(seconds(off_hold)), token).await {
                    return Ok(());
                }
                if !self.ramp_phase(Status::RampDown, CycleConfig::ramp_to_on, token).await? {
                    return Ok(());
                }
            }

            let pause = self.config.snapshot().pause_time;
            if !self.hold_phase(Status::VoltageOn, Some(seconds(pause)), token).await {
                return Ok(());
            }
            *completed += 1;
            *self
                .last_depolarisation
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
            DEPOLARISATIONS_COMPLETED.inc();
            self.exchange
                .emit(ControlEvent::DepolarisationCompleted { repeats });
            info!(repeats, "Depolarisation completed");

            let max_time = self.config.snapshot().max_time;
            let rest = (max_time > 0.0).then(|| seconds(max_time));
            if !self.hold_phase(Status::VoltageOn, rest, token).await {
                return Ok(());
            }
        }
    }

    /// ON hold inside a batch. A zero `hold_time` waits out the rest of
    /// `max_time` counted from the last depolarisation (or cycle start);
    /// `None` means hold until stopped.
    fn on_hold_duration(&self, cycle_start: Instant) -> Option<Duration> {
        let config = self.config.snapshot();
        if config.hold_time > 0.0 {
            return Some(seconds(config.hold_time));
        }
        if config.max_time <= 0.0 {
            return None;
        }
        let since = self.last_depolarisation().unwrap_or(cycle_start);
        Some(seconds(config.max_time).saturating_sub(since.elapsed()))
    }

    async fn ramp_phase(
        &self,
        status: Status,
        spec: fn(&CycleConfig) -> RampSpec,
        token: &AbortToken,
    ) -> DriverResult<bool> {
        if token.is_triggered() {
            return Ok(false);
        }
        self.exchange.set_status(status);
        let spec = spec(&self.config.snapshot());
        let outcome = self.engine.run(spec, token).await?;
        Ok(!outcome.is_aborted() && !token.is_triggered())
    }

    async fn hold_phase(&self, status: Status, duration: Option<Duration>, token: &AbortToken) -> bool {
        if token.is_triggered() {
            return false;
        }
        self.exchange.set_status(status);
        match duration {
            Some(duration) => hold(duration, token).await,
            None => {
                hold_until_aborted(token).await;
                false
            }
        }
    }
}
