//! Record-layer bridge: JSON lines over TCP.
//!
//! Each client receives a `state` message every publish interval and may send
//! `hello`, `command` and `config` messages, each answered with an `ack`.

use crate::control::{hold_until_aborted, BiasController};
use crate::metrics::BRIDGE_CLIENTS;
use crate::protocol::{AckMsg, HelloMsg, IncomingMessage, StateMsg};
use bias_core::{tags, AbortToken, TimeBase};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub record_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7010".to_string(),
            publish_interval: Duration::from_millis(500),
            record_prefix: tags::RECORD_PREFIX.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Full record names of the readbacks each `state` message carries.
    pub fn record_names(&self) -> Vec<String> {
        tags::READBACK_TAGS
            .iter()
            .map(|tag| tag.record_name(&self.record_prefix))
            .collect()
    }
}

#[derive(Debug, Default)]
struct InboundState {
    last_sequence: Option<u64>,
    handshake_seen: bool,
    client_id: Option<String>,
}

impl InboundState {
    /// Zero means unsequenced and is always accepted.
    fn accept_sequence(&mut self, sequence: u64) -> bool {
        if sequence == 0 {
            return true;
        }
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                warn!(sequence, last_sequence = last, "Out-of-order client sequence");
                return false;
            }
        }
        self.last_sequence = Some(sequence);
        true
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.client_id.clone_from(&hello.client_id);
    }
}

/// Accept loop on an already bound listener. Returns when `shutdown` trips.
pub async fn serve_bridge(
    listener: TcpListener,
    controller: Arc<BiasController>,
    timebase: TimeBase,
    config: BridgeConfig,
    shutdown: AbortToken,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| config.bind_addr.clone());
    info!(addr = %addr, prefix = %config.record_prefix, "Record bridge listening");
    debug!(records = ?config.record_names(), "Publishing readbacks");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let client = Client {
                        controller: Arc::clone(&controller),
                        timebase,
                        config: config.clone(),
                        shutdown: shutdown.clone(),
                    };
                    tokio::spawn(client.serve(stream, peer));
                }
                Err(err) => warn!(error = %err, "Bridge accept error"),
            },
            _ = hold_until_aborted(&shutdown) => break,
        }
    }
    info!("Record bridge stopped");
}

struct Client {
    controller: Arc<BiasController>,
    timebase: TimeBase,
    config: BridgeConfig,
    shutdown: AbortToken,
}

impl Client {
    #[instrument(skip_all, fields(peer = %peer))]
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        info!("Bridge client connected");
        BRIDGE_CLIENTS.inc();

        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut ticker = tokio::time::interval(self.config.publish_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inbound = InboundState::default();
        let mut state_sequence: u64 = 0;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let ack = self.handle_line(trimmed, &mut inbound).await;
                        if let Err(err) = write_json(&mut write_half, &ack).await {
                            warn!(error = %err, "Bridge write error");
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("Bridge client disconnected");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "Bridge read error");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    state_sequence = state_sequence.wrapping_add(1);
                    let snapshot = self.controller.exchange().read_state();
                    let msg = StateMsg::new(
                        state_sequence,
                        self.timebase.unix_us(),
                        &self.config.record_prefix,
                        &snapshot,
                        self.controller.config().snapshot(),
                    );
                    if let Err(err) = write_json(&mut write_half, &msg).await {
                        warn!(error = %err, "Bridge write error");
                        break;
                    }
                }
                _ = hold_until_aborted(&self.shutdown) => break,
            }
        }

        BRIDGE_CLIENTS.dec();
        debug!(
            handshake = inbound.handshake_seen,
            client_id = ?inbound.client_id,
            "Bridge client closed"
        );
    }

    async fn handle_line(&self, line: &str, inbound: &mut InboundState) -> AckMsg {
        let status = || self.controller.exchange().status().as_str();
        let Some(msg) = IncomingMessage::parse(line) else {
            warn!(line, "Unrecognised bridge message");
            return AckMsg::error(0, status(), "unrecognised message");
        };
        let sequence = msg.sequence();
        if !msg.protocol_version().is_supported() {
            return AckMsg::error(sequence, status(), "unsupported protocol version");
        }
        if !inbound.accept_sequence(sequence) {
            return AckMsg::error(sequence, status(), "out-of-order sequence");
        }

        match msg {
            IncomingMessage::Hello(hello) => {
                info!(client_id = ?hello.client_id, "Bridge handshake");
                inbound.note_handshake(&hello);
                AckMsg::ok(sequence, status())
            }
            IncomingMessage::Command(cmd) => match self.controller.handle(cmd.command).await {
                Ok(()) => AckMsg::ok(sequence, status()),
                Err(err) => AckMsg::error(sequence, status(), err.to_string()),
            },
            IncomingMessage::Config(cfg) => {
                if cfg.update.is_empty() {
                    return AckMsg::error(sequence, status(), "empty configuration update");
                }
                match self.controller.update_config(&cfg.update) {
                    Ok(_) => AckMsg::ok(sequence, status()),
                    Err(err) => AckMsg::error(sequence, status(), err.to_string()),
                }
            }
        }
    }
}

async fn write_json<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(msg)?;
    payload.push(b'\n');
    writer.write_all(&payload).await
}
