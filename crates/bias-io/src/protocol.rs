//! JSON-lines messages exchanged with record-layer clients.

use crate::control::Command;
use crate::state::BiasSnapshot;
use bias_core::{tags, ConfigUpdate, CycleConfig};
use serde::{Deserialize, Serialize};

pub const STATE_TAGS: &[tags::Tag] = &tags::READBACK_TAGS;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn v1() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// A missing version deserialises as 0.0 and is accepted as v1.
    pub fn is_supported(&self) -> bool {
        self.major == 1 || *self == Self::default()
    }
}

/// Periodic readback publication. Keys follow [`STATE_TAGS`].
#[derive(Debug, Serialize)]
pub struct StateMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub protocol_version: ProtocolVersion,
    pub sequence: u64,
    pub unix_us: u64,
    pub record_prefix: String,
    pub voltage: f64,
    pub current_ma: f64,
    pub output_on: bool,
    pub status: &'static str,
    pub status_index: u8,
    pub healthy: bool,
    pub cycle_running: bool,
    pub seconds_since_depolarisation: u64,
    pub config: CycleConfig,
}

impl StateMsg {
    pub fn new(
        sequence: u64,
        unix_us: u64,
        record_prefix: &str,
        snapshot: &BiasSnapshot,
        config: CycleConfig,
    ) -> Self {
        Self {
            msg_type: "state",
            protocol_version: ProtocolVersion::v1(),
            sequence,
            unix_us,
            record_prefix: record_prefix.to_string(),
            voltage: snapshot.voltage,
            current_ma: snapshot.current_ma,
            output_on: snapshot.output_on,
            status: snapshot.status.as_str(),
            status_index: snapshot.status.index(),
            healthy: snapshot.healthy,
            cycle_running: snapshot.cycle_running,
            seconds_since_depolarisation: snapshot.seconds_since_depolarisation,
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HelloMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
    pub command: Command,
}

#[derive(Debug, Deserialize)]
pub struct ConfigMsg {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub sequence: u64,
    #[serde(flatten)]
    pub update: ConfigUpdate,
}

/// Reply to every client message.
#[derive(Debug, Serialize, PartialEq)]
pub struct AckMsg {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub sequence: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: &'static str,
}

impl AckMsg {
    pub fn ok(sequence: u64, status: &'static str) -> Self {
        Self {
            msg_type: "ack",
            sequence,
            ok: true,
            error: None,
            status,
        }
    }

    pub fn error(sequence: u64, status: &'static str, error: impl Into<String>) -> Self {
        Self {
            msg_type: "ack",
            sequence,
            ok: false,
            error: Some(error.into()),
            status,
        }
    }
}

#[derive(Debug)]
pub enum IncomingMessage {
    Hello(HelloMsg),
    Command(CommandMsg),
    Config(ConfigMsg),
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let msg_type = value.get("type")?.as_str()?;
        match msg_type {
            "hello" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Hello),
            "command" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Command),
            "config" => serde_json::from_value(value)
                .ok()
                .map(IncomingMessage::Config),
            _ => None,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            IncomingMessage::Hello(_) => 0,
            IncomingMessage::Command(msg) => msg.sequence,
            IncomingMessage::Config(msg) => msg.sequence,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        match self {
            IncomingMessage::Hello(msg) => msg.protocol_version,
            IncomingMessage::Command(msg) => msg.protocol_version,
            IncomingMessage::Config(msg) => msg.protocol_version,
        }
    }
}
