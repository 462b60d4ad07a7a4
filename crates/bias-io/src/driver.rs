//! Keithley 2400-series source-meter command set.

use crate::error::{DriverError, DriverResult};
use crate::transport::DeviceLink;
use bias_core::AbortToken;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Substring the identity reply must contain.
pub const DEFAULT_MODEL: &str = "MODEL 24";

pub mod scpi {
    pub const IDENTIFY: &str = "*idn?";
    pub const RESET: &str = "*RST";
    pub const SETUP: [&str; 5] = [
        ":SYSTEM:BEEPER:STATE 0",
        ":SOURCE:FUNCTION VOLTAGE",
        ":SENSE:CURRENT:RANGE:AUTO ON",
        ":SENSE:VOLTAGE:RANGE:AUTO ON",
        ":SOURCE:VOLTAGE:RANGE:AUTO ON",
    ];
    pub const VOLTAGE: &str = ":SOURCE:VOLTAGE";
    pub const VOLTAGE_QUERY: &str = ":SOURCE:VOLTAGE?";
    pub const CURRENT_QUERY: &str = ":SOURCE:CURRENT?";
    pub const FIXED_MODE: &str = ":SOURCE:VOLTAGE:MODE FIXED";
    pub const OUTPUT_ON: &str = ":OUTPUT:STATE ON";
    pub const OUTPUT_QUERY: &str = ":OUTPUT:STATE?";
    pub const CLEAR: &str = ":SOURCE:CLEAR:IMMEDIATE";
    pub const ABORT: &str = ":ABORT";
}

/// Applies the bias sign convention: whatever the caller passes, the wire
/// sees a non-positive value.
pub fn bias_setpoint(magnitude: f64) -> f64 {
    -magnitude.abs() + 0.0
}

/// The one driver instance that owns the link.
pub type SharedInstrument = Arc<tokio::sync::Mutex<Keithley>>;

pub struct Keithley {
    link: DeviceLink,
    expected_model: String,
}

impl Keithley {
    /// Verifies the identity and runs the startup block.
    pub async fn connect(link: DeviceLink, expected_model: &str) -> DriverResult<Self> {
        let mut instrument = Self {
            link,
            expected_model: expected_model.to_string(),
        };
        // Terminates any partial command left in the instrument's buffer.
        instrument.link.send("").await?;
        let model = instrument.identify().await?;
        info!(
            model = %model,
            read_timeout_ms = instrument.link.read_timeout().as_millis() as u64,
            "Instrument identified"
        );
        instrument.reset_and_configure().await?;
        Ok(instrument)
    }

    pub fn into_shared(self) -> SharedInstrument {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn last_response(&self) -> &str {
        self.link.last_response()
    }

    pub async fn identify(&mut self) -> DriverResult<String> {
        let reply = self.link.query(scpi::IDENTIFY).await?;
        if !reply.contains(&self.expected_model) {
            return Err(DriverError::IdentityMismatch {
                expected: self.expected_model.clone(),
                reply,
            });
        }
        Ok(reply.trim().to_string())
    }

    pub async fn reset_and_configure(&mut self) -> DriverResult<()> {
        self.link.send(scpi::RESET).await?;
        for command in scpi::SETUP {
            self.link.send(command).await?;
        }
        debug!("Startup configuration sent");
        Ok(())
    }

    /// Identity check and startup block again, on the existing link.
    pub async fn reinitialize(&mut self) -> DriverResult<()> {
        self.link.send("").await?;
        let model = self.identify().await?;
        info!(model = %model, "Instrument re-initialised");
        self.reset_and_configure().await
    }

    pub async fn get_voltage(&mut self) -> DriverResult<f64> {
        self.read_number(scpi::VOLTAGE_QUERY).await
    }

    /// Sends `-abs(magnitude)`.
    pub async fn set_voltage(&mut self, magnitude: f64) -> DriverResult<()> {
        let setpoint = bias_setpoint(magnitude);
        self.link
            .send(&format!("{} {}", scpi::VOLTAGE, setpoint))
            .await?;
        Ok(())
    }

    /// Milliamps.
    pub async fn get_current(&mut self) -> DriverResult<f64> {
        let amps = self.read_number(scpi::CURRENT_QUERY).await?;
        Ok(amps * 1000.0)
    }

    pub async fn source_on(&mut self) -> DriverResult<()> {
        self.link.send(scpi::OUTPUT_ON).await?;
        Ok(())
    }

    pub async fn source_off(&mut self) -> DriverResult<()> {
        self.link.send(scpi::CLEAR).await?;
        Ok(())
    }

    pub async fn get_source_status(&mut self) -> DriverResult<bool> {
        let reply = self.link.query(scpi::OUTPUT_QUERY).await?;
        let state = match reply.trim() {
            "1" | "ON" => Some(true),
            "0" | "OFF" => Some(false),
            _ => None,
        };
        state.ok_or_else(|| self.parse_error(scpi::OUTPUT_QUERY, reply))
    }

    pub async fn set_fixed_voltage_mode(&mut self) -> DriverResult<()> {
        self.link.send(scpi::FIXED_MODE).await?;
        Ok(())
    }

    /// Trips `token` so a concurrent ramp stops at its next step, then
    /// aborts whatever the instrument is doing.
    pub async fn abort(&mut self, token: &AbortToken) -> DriverResult<()> {
        token.trigger();
        self.link.send(scpi::ABORT).await?;
        Ok(())
    }

    async fn read_number(&mut self, command: &'static str) -> DriverResult<f64> {
        let reply = self.link.query(command).await?;
        match reply.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(self.parse_error(command, reply)),
        }
    }

    fn parse_error(&self, command: &'static str, reply: String) -> DriverError {
        warn!(
            command,
            reply = %reply,
            last_response = %self.link.last_response(),
            "Unexpected instrument reply"
        );
        DriverError::Parse { command, reply }
    }
}
