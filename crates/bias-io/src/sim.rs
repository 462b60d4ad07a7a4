//! In-process stand-in for the source-meter, speaking the same line protocol.

use crate::error::TransportError;
use crate::transport::{is_query, LineIo};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const SIM_IDENTITY: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 2410,4090615,C34 Sep 21 2016 15:30:00/A02  /J/H";

const WIRE_LOG_CAPACITY: usize = 4096;

/// Leakage through the detector, amps per volt of bias.
const LEAKAGE_A_PER_V: f64 = 1e-7;

#[derive(Debug)]
struct SimState {
    identity: String,
    voltage: f64,
    output_on: bool,
    aborts: u64,
    pending: VecDeque<String>,
    injected: VecDeque<String>,
    wire_log: VecDeque<String>,
    silent: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            identity: SIM_IDENTITY.to_string(),
            voltage: 0.0,
            output_on: false,
            aborts: 0,
            pending: VecDeque::new(),
            injected: VecDeque::new(),
            wire_log: VecDeque::new(),
            silent: false,
        }
    }
}

impl SimState {
    fn handle_line(&mut self, line: &str) {
        if self.wire_log.len() == WIRE_LOG_CAPACITY {
            self.wire_log.pop_front();
        }
        self.wire_log.push_back(line.to_string());
        if self.silent {
            return;
        }

        let command = line.trim().to_ascii_uppercase();
        if is_query(&command) {
            let reply = match self.injected.pop_front() {
                Some(reply) => reply,
                None => self.answer(&command),
            };
            self.pending.push_back(reply);
            return;
        }
        self.apply(&command);
    }

    fn answer(&self, query: &str) -> String {
        match query {
            "*IDN?" => self.identity.clone(),
            ":SOURCE:VOLTAGE?" => format!("{:.6E}", self.voltage),
            ":SOURCE:CURRENT?" => {
                let amps = if self.output_on {
                    self.voltage.abs() * LEAKAGE_A_PER_V
                } else {
                    0.0
                };
                format!("{amps:.6E}")
            }
            ":OUTPUT:STATE?" => (if self.output_on { "1" } else { "0" }).to_string(),
            _ => "-113,\"Undefined header\"".to_string(),
        }
    }

    fn apply(&mut self, command: &str) {
        match command {
            "*RST" => {
                self.voltage = 0.0;
                self.output_on = false;
            }
            ":OUTPUT:STATE ON" => self.output_on = true,
            ":SOURCE:CLEAR:IMMEDIATE" | ":OUTPUT:STATE OFF" => self.output_on = false,
            ":ABORT" => self.aborts += 1,
            _ => {
                if let Some(value) = command.strip_prefix(":SOURCE:VOLTAGE ") {
                    if let Ok(volts) = value.trim().parse::<f64>() {
                        self.voltage = volts;
                    }
                }
            }
        }
    }
}

/// The link end handed to [`DeviceLink`](crate::transport::DeviceLink).
pub struct SimulatedSource {
    state: Arc<Mutex<SimState>>,
}

/// Test and demo handle onto the simulated instrument.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSource {
    pub fn new() -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LineIo for SimulatedSource {
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        self.state().handle_line(line);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let reply = self.state().pending.pop_front();
        match reply {
            Some(reply) => Ok(reply),
            None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn discard_input(&mut self) -> Result<usize, TransportError> {
        let mut state = self.state();
        let bytes = state.pending.iter().map(|r| r.len() + 1).sum();
        state.pending.clear();
        Ok(bytes)
    }
}

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn voltage(&self) -> f64 {
        self.state().voltage
    }

    /// Moves the output as if the front panel had been used.
    pub fn set_voltage(&self, volts: f64) {
        self.state().voltage = volts;
    }

    pub fn output_on(&self) -> bool {
        self.state().output_on
    }

    pub fn abort_count(&self) -> u64 {
        self.state().aborts
    }

    pub fn set_identity(&self, identity: impl Into<String>) {
        self.state().identity = identity.into();
    }

    /// Replaces the reply to the next query.
    pub fn inject_reply(&self, reply: impl Into<String>) {
        self.state().injected.push_back(reply.into());
    }

    /// A silent instrument accepts every line and never answers.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Every line received, oldest first, bounded to the most recent entries.
    pub fn wire_log(&self) -> Vec<String> {
        self.state().wire_log.iter().cloned().collect()
    }

    pub fn clear_log(&self) {
        self.state().wire_log.clear();
    }

    /// Setpoints written with `:SOURCE:VOLTAGE <v>`, in order.
    pub fn voltage_writes(&self) -> Vec<f64> {
        self.state()
            .wire_log
            .iter()
            .filter_map(|line| line.strip_prefix(":SOURCE:VOLTAGE "))
            .filter_map(|value| value.trim().parse::<f64>().ok())
            .collect()
    }
}
