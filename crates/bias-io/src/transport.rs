//! Newline-framed request/response exchange with the instrument.

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, trace, warn};

/// Byte link carrying one text line per command or reply.
#[async_trait]
pub trait LineIo: Send {
    /// Writes `line` plus the terminator and flushes.
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Reads one line, without its terminator, or fails after `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Drops anything already received but not yet read. Returns the byte count.
    async fn discard_input(&mut self) -> Result<usize, TransportError>;
}

/// [`LineIo`] over any async byte stream (serial port, in-memory pipe).
pub struct LineStream<S> {
    stream: S,
    read_buf: Vec<u8>,
}

impl<S> LineStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::with_capacity(256),
        }
    }

    fn take_line(&mut self) -> Option<Result<String, TransportError>> {
        let pos = self.read_buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.read_buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8(line).map_err(TransportError::from))
    }
}

#[async_trait]
impl<S> LineIo for LineStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = self.take_line() {
                return line;
            }
            match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => return Err(TransportError::Timeout(timeout)),
                Ok(Ok(0)) => return Err(TransportError::Closed),
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
            }
        }
    }

    async fn discard_input(&mut self) -> Result<usize, TransportError> {
        let mut dropped = self.read_buf.len();
        self.read_buf.clear();
        let mut chunk = [0u8; 256];
        // A zero timeout still polls the read once, so only bytes that have
        // already arrived are consumed.
        loop {
            match tokio::time::timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => dropped += n,
                Ok(Err(e)) => return Err(TransportError::Io(e)),
            }
        }
        Ok(dropped)
    }
}

/// Commands ending in `?` expect exactly one reply line.
pub fn is_query(command: &str) -> bool {
    command.trim_end().ends_with('?')
}

/// Exclusive owner of the instrument connection.
pub struct DeviceLink {
    io: Box<dyn LineIo>,
    read_timeout: Duration,
    last_response: String,
}

impl DeviceLink {
    pub fn new(io: impl LineIo + 'static, read_timeout: Duration) -> Self {
        Self {
            io: Box::new(io),
            read_timeout,
            last_response: String::new(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Most recent non-empty reply, kept for diagnostics.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Fire-and-forget action. Queries are rejected.
    pub async fn send(&mut self, command: &str) -> Result<(), TransportError> {
        if is_query(command) {
            return Err(TransportError::UnexpectedQuery(command.to_string()));
        }
        debug!(command, "send");
        self.io.write_line(command).await
    }

    /// Writes `command` and waits for its reply line.
    pub async fn query(&mut self, command: &str) -> Result<String, TransportError> {
        let stale = self.io.discard_input().await?;
        if stale > 0 {
            warn!(command, stale_bytes = stale, "Discarded unread input before query");
        }
        self.io.write_line(command).await?;
        let reply = self.io.read_line(self.read_timeout).await?;
        trace!(command, reply = %reply, "query");
        if !reply.trim().is_empty() {
            self.last_response.clone_from(&reply);
        }
        Ok(reply)
    }
}

/// Serial port parameters. The instrument runs 8N1 without flow control.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 38_400,
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub fn open_serial(settings: &SerialSettings) -> Result<DeviceLink, TransportError> {
    let port = tokio_serial::new(settings.path.as_str(), settings.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(settings.read_timeout)
        .open_native_async()
        .map_err(|source| TransportError::Open {
            path: settings.path.clone(),
            source,
        })?;
    debug!(path = %settings.path, baud = settings.baud_rate, "Serial port open");
    Ok(DeviceLink::new(LineStream::new(port), settings.read_timeout))
}
