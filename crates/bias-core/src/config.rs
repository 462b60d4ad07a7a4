use crate::ramp::RampSpec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Largest setpoint magnitude accepted from configuration.
pub const MAX_BIAS_VOLTS: f64 = 1100.0;

/// Depolarisation cycle parameters.
///
/// Setpoints are magnitudes; the driver applies the sign. Times are seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub on_setpoint: f64,
    pub off_setpoint: f64,
    pub step_size: f64,
    pub rise_time: f64,
    pub hold_time: f64,
    pub fall_time: f64,
    pub pause_time: f64,
    pub repeats: u32,
    pub max_time: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            on_setpoint: 500.0,
            off_setpoint: 0.0,
            step_size: 5.0,
            rise_time: 0.25,
            hold_time: 1.0,
            fall_time: 0.2,
            pause_time: 0.0,
            repeats: 1,
            max_time: 900.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("step_size must be positive, got {0}")]
    NonPositiveStep(f64),
    #[error("repeats must be at least 1")]
    ZeroRepeats,
    #[error("{field} magnitude {value} exceeds {limit} V")]
    ExceedsLimit {
        field: &'static str,
        value: f64,
        limit: f64,
    },
    #[error("invalid cycle configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CycleConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CycleConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("on_setpoint", self.on_setpoint),
            ("off_setpoint", self.off_setpoint),
            ("step_size", self.step_size),
            ("rise_time", self.rise_time),
            ("hold_time", self.hold_time),
            ("fall_time", self.fall_time),
            ("pause_time", self.pause_time),
            ("max_time", self.max_time),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(ConfigError::NonFinite { field, value });
            }
        }
        for (field, value) in [
            ("rise_time", self.rise_time),
            ("hold_time", self.hold_time),
            ("fall_time", self.fall_time),
            ("pause_time", self.pause_time),
            ("max_time", self.max_time),
        ] {
            if value < 0.0 {
                return Err(ConfigError::Negative { field, value });
            }
        }
        if self.step_size <= 0.0 {
            return Err(ConfigError::NonPositiveStep(self.step_size));
        }
        if self.repeats == 0 {
            return Err(ConfigError::ZeroRepeats);
        }
        for (field, value) in [("on_setpoint", self.on_setpoint), ("off_setpoint", self.off_setpoint)] {
            if value.abs() > MAX_BIAS_VOLTS {
                return Err(ConfigError::ExceedsLimit {
                    field,
                    value,
                    limit: MAX_BIAS_VOLTS,
                });
            }
        }
        Ok(())
    }

    /// Ramp from wherever the bias is to the operating setpoint.
    pub fn ramp_to_on(&self) -> RampSpec {
        RampSpec::new(self.on_setpoint, self.step_size, self.fall_time)
    }

    /// Ramp from wherever the bias is to the depolarising setpoint.
    pub fn ramp_to_off(&self) -> RampSpec {
        RampSpec::new(self.off_setpoint, self.step_size, self.rise_time)
    }
}

/// Partial update from the record layer. Absent fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_setpoint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_setpoint: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rise_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fall_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeats: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<f64>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, config: &CycleConfig) -> CycleConfig {
        CycleConfig {
            on_setpoint: self.on_setpoint.unwrap_or(config.on_setpoint),
            off_setpoint: self.off_setpoint.unwrap_or(config.off_setpoint),
            step_size: self.step_size.unwrap_or(config.step_size),
            rise_time: self.rise_time.unwrap_or(config.rise_time),
            hold_time: self.hold_time.unwrap_or(config.hold_time),
            fall_time: self.fall_time.unwrap_or(config.fall_time),
            pause_time: self.pause_time.unwrap_or(config.pause_time),
            repeats: self.repeats.unwrap_or(config.repeats),
            max_time: self.max_time.unwrap_or(config.max_time),
        }
    }
}

/// Configuration shared between the record layer and the control tasks.
///
/// Readers call [`snapshot`](Self::snapshot) at the start of each phase, so
/// an update lands on the next phase rather than the one in progress.
#[derive(Debug, Clone, Default)]
pub struct SharedCycleConfig {
    inner: Arc<RwLock<CycleConfig>>,
}

impl SharedCycleConfig {
    pub fn new(config: CycleConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> CycleConfig {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validates the merged result before storing it. On error the stored
    /// configuration is untouched.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<CycleConfig, ConfigError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let next = update.apply_to(&guard);
        next.validate()?;
        *guard = next;
        Ok(next)
    }
}
