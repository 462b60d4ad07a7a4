use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally visible state of the bias supply.
///
/// Discriminants are the indices of the record layer's status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
#[repr(u8)]
pub enum Status {
    #[default]
    VoltageOff = 0,
    VoltageOn = 1,
    RampUp = 2,
    Hold = 3,
    RampDown = 4,
    Error = 5,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::VoltageOff => "VOLTAGE-OFF",
            Status::VoltageOn => "VOLTAGE-ON",
            Status::RampUp => "RAMP-UP",
            Status::Hold => "HOLD",
            Status::RampDown => "RAMP-DOWN",
            Status::Error => "ERROR",
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
