//! Audit trail for operator-visible events.
//!
//! One JSON object per line: process start and stop, the instrument connection,
//! and every control event (commands, configuration changes, status
//! transitions, ramp results, cycle lifecycle and faults).

use bias_core::{AbortToken, TimeBase};
use bias_io::control::hold_until_aborted;
use bias_io::ControlEvent;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    InstrumentConnected,
    CommandReceived,
    ConfigChange,
    StatusChange,
    RampFinished,
    CycleStarted,
    CycleStopped,
    DepolarisationCompleted,
    Fault,
}

impl AuditEventType {
    pub fn for_event(event: &ControlEvent) -> Self {
        match event {
            ControlEvent::StatusChanged { .. } => AuditEventType::StatusChange,
            ControlEvent::CommandHandled { .. } => AuditEventType::CommandReceived,
            ControlEvent::RampFinished { .. } => AuditEventType::RampFinished,
            ControlEvent::CycleStarted => AuditEventType::CycleStarted,
            ControlEvent::DepolarisationCompleted { .. } => AuditEventType::DepolarisationCompleted,
            ControlEvent::CycleStopped => AuditEventType::CycleStopped,
            ControlEvent::ConfigChanged { .. } => AuditEventType::ConfigChange,
            ControlEvent::Fault { .. } => AuditEventType::Fault,
        }
    }
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Microseconds since process start
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Appends entries to a JSONL file. Safe to share between tasks.
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timebase: &TimeBase,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            timestamp_us: timebase.now_us(),
            unix_us: timebase.unix_us(),
            event_type,
            details,
        })
    }

    pub fn log_control_event(&self, timebase: &TimeBase, event: &ControlEvent) -> std::io::Result<()> {
        let details = serde_json::to_value(event)?;
        self.log_event(timebase, AuditEventType::for_event(event), details)
    }
}

/// Writes every control event to the audit trail until `shutdown` trips or the
/// event stream closes.
pub async fn forward_events(
    logger: Arc<AuditLogger>,
    mut events: broadcast::Receiver<ControlEvent>,
    timebase: TimeBase,
    shutdown: AbortToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = hold_until_aborted(&shutdown) => break,
        };
        match event {
            Ok(event) => {
                if let Err(err) = logger.log_control_event(&timebase, &event) {
                    warn!(error = %err, "Audit write failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Audit trail fell behind; events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    // Whatever was queued before shutdown still goes to disk.
    while let Ok(event) = events.try_recv() {
        if let Err(err) = logger.log_control_event(&timebase, &event) {
            warn!(error = %err, "Audit write failed");
        }
    }
}
