pub mod abort;
pub mod config;
pub mod health;
pub mod ramp;
pub mod status;
pub mod tags;
pub mod timebase;

pub use abort::AbortToken;
pub use config::{ConfigError, ConfigUpdate, CycleConfig, SharedCycleConfig, MAX_BIAS_VOLTS};
pub use health::{at_off_setpoint, is_healthy, DepolarisationTimer, MaxTimeTrigger};
pub use ramp::{RampPlan, RampSpec, LOOP_OVERHEAD, MAX_RATE_HZ};
pub use status::Status;
pub use timebase::TimeBase;
