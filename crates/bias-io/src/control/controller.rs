use super::{enter_error, CycleController, RampEngine, RampOutcome};
use crate::driver::SharedInstrument;
use crate::error::{ControlError, DriverError};
use crate::metrics::{COMMANDS_RECEIVED, COMMANDS_REFUSED};
use crate::state::{ControlEvent, StateExchange};
use bias_core::{
    AbortToken, ConfigError, ConfigUpdate, CycleConfig, RampSpec, SharedCycleConfig, Status,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One-shot operator commands from the record layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    RampOn,
    RampOff,
    Depolarise,
    Stop,
    OutputOn,
    OutputOff,
    Reinitialize,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::RampOn => "ramp_on",
            Command::RampOff => "ramp_off",
            Command::Depolarise => "depolarise",
            Command::Stop => "stop",
            Command::OutputOn => "output_on",
            Command::OutputOff => "output_off",
            Command::Reinitialize => "reinitialize",
        }
    }

    /// Commands that start a ramp or cycle. Refused while in `Error`.
    pub fn starts_operation(&self) -> bool {
        matches!(self, Command::RampOn | Command::RampOff | Command::Depolarise)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RampDirection {
    /// Output on, then down to the on setpoint.
    On,
    /// Up to the off setpoint.
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Ramp(RampDirection),
    Cycle,
}

struct ActiveOperation {
    kind: OperationKind,
    token: AbortToken,
    handle: JoinHandle<()>,
}

impl ActiveOperation {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Trips the token and waits for the task to reach a step or phase boundary.
    async fn cancel(self) {
        self.token.trigger();
        if let Err(err) = self.handle.await {
            error!(kind = ?self.kind, error = %err, "Operation task ended abnormally");
        }
    }
}

/// Owns the single ramp-or-cycle operation and maps commands onto it.
///
/// Starting an operation supersedes the running one: its token is tripped,
/// the task is awaited, and the new operation gets a fresh token.
pub struct BiasController {
    instrument: SharedInstrument,
    config: SharedCycleConfig,
    exchange: Arc<StateExchange>,
    engine: RampEngine,
    cycle: Arc<CycleController>,
    active: Mutex<Option<ActiveOperation>>,
}

impl BiasController {
    pub fn new(instrument: SharedInstrument, config: SharedCycleConfig, exchange: Arc<StateExchange>) -> Self {
        let engine = RampEngine::new(Arc::clone(&instrument), Arc::clone(&exchange));
        let cycle = Arc::new(CycleController::new(
            engine.clone(),
            config.clone(),
            Arc::clone(&exchange),
        ));
        Self {
            instrument,
            config,
            exchange,
            engine,
            cycle,
            active: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> &Arc<StateExchange> {
        &self.exchange
    }

    pub fn config(&self) -> &SharedCycleConfig {
        &self.config
    }

    pub fn cycle(&self) -> &Arc<CycleController> {
        &self.cycle
    }

    /// True while a ramp or cycle task is still running.
    pub async fn is_busy(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(ActiveOperation::is_running)
    }

    pub async fn handle(&self, command: Command) -> Result<(), ControlError> {
        COMMANDS_RECEIVED.inc();
        info!(command = command.as_str(), "Command received");

        let status = self.exchange.status();
        if status == Status::Error && command.starts_operation() {
            COMMANDS_REFUSED.inc();
            warn!(command = command.as_str(), "Refused while in ERROR; reinitialize first");
            self.exchange.emit(ControlEvent::CommandHandled {
                command,
                accepted: false,
            });
            return Err(ControlError::Refused {
                command: command.as_str(),
                status,
            });
        }

        let result = match command {
            Command::RampOn => self.start_ramp(RampDirection::On).await,
            Command::RampOff => self.start_ramp(RampDirection::Off).await,
            Command::Depolarise => self.start_cycle().await,
            Command::Stop => self.stop().await,
            Command::OutputOn => self.set_output(true).await,
            Command::OutputOff => self.set_output(false).await,
            Command::Reinitialize => self.reinitialize().await,
        };
        self.exchange.emit(ControlEvent::CommandHandled {
            command,
            accepted: result.is_ok(),
        });
        if let Err(err) = &result {
            enter_error(&self.exchange, err);
        }
        result.map_err(ControlError::from)
    }

    /// Trips the running operation's token, sends `:ABORT` and leaves the
    /// supply in `Hold` if anything was running.
    pub async fn stop(&self) -> Result<(), DriverError> {
        let mut active = self.active.lock().await;
        let operation = active.take();
        let token = operation
            .as_ref()
            .map(|op| op.token.clone())
            .unwrap_or_default();
        let was_running = operation.as_ref().is_some_and(ActiveOperation::is_running);
        token.trigger();

        self.instrument.lock().await.abort(&token).await?;
        if let Some(operation) = operation {
            operation.cancel().await;
        }
        if was_running {
            self.exchange.set_cycle_running(false);
            self.exchange.set_status(Status::Hold);
        }
        Ok(())
    }

    async fn start_ramp(&self, direction: RampDirection) -> Result<(), DriverError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!(kind = ?previous.kind, "Superseding running operation");
            previous.cancel().await;
        }

        let config = self.config.snapshot();
        let (spec, ramping, settled): (RampSpec, Status, Status) = match direction {
            RampDirection::On => {
                self.instrument.lock().await.source_on().await?;
                (config.ramp_to_on(), Status::RampDown, Status::VoltageOn)
            }
            RampDirection::Off => (config.ramp_to_off(), Status::RampUp, Status::VoltageOff),
        };
        self.exchange.set_cycle_running(false);
        self.exchange.set_status(ramping);

        let token = AbortToken::new();
        let engine = self.engine.clone();
        let exchange = Arc::clone(&self.exchange);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            match engine.run(spec, &task_token).await {
                Ok(RampOutcome::Aborted { .. }) => {
                    exchange.set_status(Status::Hold);
                }
                Ok(_) => {
                    exchange.set_status(settled);
                }
                Err(err) => enter_error(&exchange, &err),
            }
        });
        *active = Some(ActiveOperation {
            kind: OperationKind::Ramp(direction),
            token,
            handle,
        });
        Ok(())
    }

    async fn start_cycle(&self) -> Result<(), DriverError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!(kind = ?previous.kind, "Superseding running operation");
            previous.cancel().await;
        }

        self.instrument.lock().await.source_on().await?;

        let token = AbortToken::new();
        let cycle = Arc::clone(&self.cycle);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            // Failures already moved the status to ERROR.
            let _ = cycle.run(&task_token).await;
        });
        *active = Some(ActiveOperation {
            kind: OperationKind::Cycle,
            token,
            handle,
        });
        Ok(())
    }

    async fn set_output(&self, on: bool) -> Result<(), DriverError> {
        if on {
            return self.instrument.lock().await.source_on().await;
        }
        self.cancel_active().await;
        self.instrument.lock().await.source_off().await?;
        self.exchange.set_status(Status::VoltageOff);
        Ok(())
    }

    /// Repeats identification and setup on the existing link. Clears `Error`.
    async fn reinitialize(&self) -> Result<(), DriverError> {
        self.cancel_active().await;
        self.instrument.lock().await.reinitialize().await?;
        self.exchange.clear_error();
        self.exchange.set_status(Status::VoltageOff);
        Ok(())
    }

    async fn cancel_active(&self) {
        let mut active = self.active.lock().await;
        if let Some(operation) = active.take() {
            operation.cancel().await;
        }
        self.exchange.set_cycle_running(false);
    }

    /// Applies a configuration update and announces it.
    pub fn update_config(&self, update: &ConfigUpdate) -> Result<CycleConfig, ConfigError> {
        let config = self.config.apply(update)?;
        info!(?config, "Cycle configuration updated");
        self.exchange.emit(ControlEvent::ConfigChanged { config });
        Ok(config)
    }
}

/// Serial command loop: one command at a time, in arrival order.
pub async fn run_commands(controller: Arc<BiasController>, mut commands: mpsc::Receiver<Command>) {
    while let Some(command) = commands.recv().await {
        if let Err(err) = controller.handle(command).await {
            warn!(command = command.as_str(), error = %err, "Command failed");
        }
    }
    debug!("Command channel closed");
}
