use super::hold;
use crate::driver::{bias_setpoint, SharedInstrument};
use crate::error::{DriverError, DriverResult};
use crate::metrics::{RAMPS_ABORTED, RAMPS_COMPLETED, RAMP_DURATION_SECONDS};
use crate::state::{ControlEvent, StateExchange};
use bias_core::{AbortToken, RampSpec};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RampOutcome {
    /// Zero duration or already at target. Nothing was commanded.
    Skipped,
    Completed { final_volts: f64 },
    /// Stopped by the abort token. `last_volts` is the last commanded step.
    Aborted { last_volts: Option<f64> },
}

impl RampOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RampOutcome::Skipped => "skipped",
            RampOutcome::Completed { .. } => "completed",
            RampOutcome::Aborted { .. } => "aborted",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RampOutcome::Aborted { .. })
    }
}

/// Executes stepped ramps against the shared instrument.
///
/// The instrument lock is taken per step (set plus readback), so the poller
/// interleaves with a running ramp but never splits an exchange.
#[derive(Clone)]
pub struct RampEngine {
    instrument: SharedInstrument,
    exchange: Arc<StateExchange>,
}

impl RampEngine {
    pub fn new(instrument: SharedInstrument, exchange: Arc<StateExchange>) -> Self {
        Self {
            instrument,
            exchange,
        }
    }

    #[instrument(skip(self, token), fields(target_volts = spec.target()))]
    pub async fn run(&self, spec: RampSpec, token: &AbortToken) -> DriverResult<RampOutcome> {
        if !spec.has_duration() {
            debug!("Ramp has no duration; skipped");
            return Ok(RampOutcome::Skipped);
        }

        let started = Instant::now();
        let v0 = self.instrument.lock().await.get_voltage().await?;
        self.exchange.publish_voltage(v0);

        let Some(plan) = spec.plan(v0) else {
            debug!(voltage = v0, "Already at target; ramp skipped");
            return Ok(RampOutcome::Skipped);
        };
        debug!(
            start = v0,
            steps = plan.steps(),
            step_size = plan.step_size(),
            interval_ms = plan.interval().as_millis() as u64,
            "Ramp planned"
        );

        self.instrument.lock().await.set_fixed_voltage_mode().await?;

        let mut last_volts = None;
        for (i, setpoint) in plan.setpoints().enumerate() {
            if token.is_triggered() {
                return Ok(self.finish(plan.target(), RampOutcome::Aborted { last_volts }, started));
            }
            {
                let mut instrument = self.instrument.lock().await;
                instrument.set_voltage(setpoint).await?;
                match instrument.get_voltage().await {
                    Ok(volts) => self.exchange.publish_voltage(volts),
                    Err(err @ DriverError::Parse { .. }) => {
                        warn!(step = i, error = %err, "Ramp readback skipped");
                    }
                    Err(err) => return Err(err),
                }
            }
            last_volts = Some(bias_setpoint(setpoint));

            if i < plan.steps() as usize && !hold(plan.interval(), token).await {
                return Ok(self.finish(plan.target(), RampOutcome::Aborted { last_volts }, started));
            }
        }

        Ok(self.finish(
            plan.target(),
            RampOutcome::Completed {
                final_volts: plan.target(),
            },
            started,
        ))
    }

    fn finish(&self, target_volts: f64, outcome: RampOutcome, started: Instant) -> RampOutcome {
        let elapsed = started.elapsed().as_secs_f64();
        RAMP_DURATION_SECONDS.observe(elapsed);
        match outcome {
            RampOutcome::Aborted { last_volts } => {
                RAMPS_ABORTED.inc();
                info!(?last_volts, elapsed_s = elapsed, "Ramp aborted");
            }
            _ => {
                RAMPS_COMPLETED.inc();
                info!(elapsed_s = elapsed, "Ramp completed");
            }
        }
        self.exchange.emit(ControlEvent::RampFinished {
            target_volts,
            outcome: outcome.as_str().to_string(),
        });
        outcome
    }
}
