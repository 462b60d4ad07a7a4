use bias_core::Status;
use std::time::Duration;
use thiserror::Error;

/// Failures on the instrument link. Never retried here; the caller decides.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("reply is not valid UTF-8: {0}")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("link closed by peer")]
    Closed,
    #[error("'{0}' is a query and must be sent with query()")]
    UnexpectedQuery(String),
    #[error("failed to open serial port {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: tokio_serial::Error,
    },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("instrument identity mismatch: expected '{expected}', got '{reply}'")]
    IdentityMismatch { expected: String, reply: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("non-numeric reply to {command}: '{reply}'")]
    Parse { command: &'static str, reply: String },
}

impl DriverError {
    /// Readback problems that a polling loop can skip for one tick.
    pub fn is_readback_failure(&self) -> bool {
        matches!(
            self,
            DriverError::Parse { .. } | DriverError::Transport(TransportError::Timeout(_))
        )
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Why an operator command did not take effect.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{command} refused while status is {status}")]
    Refused {
        command: &'static str,
        status: Status,
    },
    #[error(transparent)]
    Driver(#[from] DriverError),
}
