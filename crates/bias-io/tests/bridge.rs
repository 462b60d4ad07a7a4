mod common;

use bias_core::{AbortToken, CycleConfig, Status, TimeBase};
use bias_io::{serve_bridge, BridgeConfig};
use common::rig;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

struct BridgeClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl BridgeClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to bridge");
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn next_message(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("bridge should answer")
            .expect("bridge read");
        line.map(|line| serde_json::from_str(&line).expect("bridge sends JSON"))
    }

    async fn next_of_type(&mut self, msg_type: &str) -> Value {
        loop {
            let msg = self.next_message().await.expect("bridge closed early");
            if msg["type"] == msg_type {
                return msg;
            }
        }
    }

    async fn request(&mut self, msg: Value) -> Value {
        let mut payload = msg.to_string();
        payload.push('\n');
        self.writer.write_all(payload.as_bytes()).await.unwrap();
        self.next_of_type("ack").await
    }
}

async fn start_bridge(rig: &common::Rig) -> (std::net::SocketAddr, AbortToken, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = AbortToken::new();
    let config = BridgeConfig {
        bind_addr: addr.to_string(),
        publish_interval: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let server = tokio::spawn(serve_bridge(
        listener,
        rig.controller(),
        TimeBase::new(),
        config,
        shutdown.clone(),
    ));
    (addr, shutdown, server)
}

#[tokio::test]
async fn publishes_state_and_acks_commands() {
    let rig = rig(CycleConfig::default()).await;
    let (addr, shutdown, server) = start_bridge(&rig).await;
    let mut client = BridgeClient::connect(addr).await;

    let state = client.next_of_type("state").await;
    assert_eq!(state["status"], "VOLTAGE-OFF");
    assert_eq!(state["record_prefix"], "BL15J-EA-HV-01");
    assert_eq!(state["protocol_version"]["major"], 1);

    let ack = client
        .request(json!({"type": "hello", "protocol_version": {"major": 1, "minor": 0}, "client_id": "test"}))
        .await;
    assert_eq!(ack["ok"], true);

    let ack = client
        .request(json!({"type": "command", "sequence": 1, "command": "output_on"}))
        .await;
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["sequence"], 1);
    assert!(rig.sim.output_on());

    let ack = client
        .request(json!({"type": "command", "sequence": 1, "command": "output_off"}))
        .await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["error"], "out-of-order sequence");
    assert!(rig.sim.output_on());

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("bridge should stop")
        .unwrap();
    // Client tasks also observe shutdown and close their side.
    while client.next_message().await.is_some() {}
}

#[tokio::test]
async fn config_updates_are_validated() {
    let rig = rig(CycleConfig::default()).await;
    let (addr, shutdown, _server) = start_bridge(&rig).await;
    let mut client = BridgeClient::connect(addr).await;

    let ack = client.request(json!({"type": "config", "sequence": 1})).await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["error"], "empty configuration update");

    let ack = client
        .request(json!({"type": "config", "sequence": 2, "repeats": 0}))
        .await;
    assert_eq!(ack["ok"], false);
    assert_eq!(rig.config.snapshot().repeats, 1);

    let ack = client
        .request(json!({"type": "config", "sequence": 3, "on_setpoint": 450.0, "hold_time": 2.5}))
        .await;
    assert_eq!(ack["ok"], true);
    let config = rig.config.snapshot();
    assert_eq!(config.on_setpoint, 450.0);
    assert_eq!(config.hold_time, 2.5);

    let state = client.next_of_type("state").await;
    assert_eq!(state["config"]["on_setpoint"], 450.0);

    shutdown.trigger();
}

#[tokio::test]
async fn refusals_and_garbage_are_acked_with_errors() {
    let rig = rig(CycleConfig::default()).await;
    let (addr, shutdown, _server) = start_bridge(&rig).await;
    let mut client = BridgeClient::connect(addr).await;
    rig.exchange.set_status(Status::Error);

    let ack = client
        .request(json!({"type": "command", "sequence": 1, "command": "ramp_on"}))
        .await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["status"], "ERROR");
    assert!(!rig.sim.output_on());

    let ack = client.request(json!({"type": "telemetry", "sequence": 2})).await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["error"], "unrecognised message");

    let ack = client
        .request(json!({"type": "command", "protocol_version": {"major": 3, "minor": 0}, "sequence": 3, "command": "stop"}))
        .await;
    assert_eq!(ack["ok"], false);
    assert_eq!(ack["error"], "unsupported protocol version");

    let ack = client
        .request(json!({"type": "command", "sequence": 4, "command": "reinitialize"}))
        .await;
    assert_eq!(ack["ok"], true);
    assert_eq!(ack["status"], "VOLTAGE-OFF");

    shutdown.trigger();
}
