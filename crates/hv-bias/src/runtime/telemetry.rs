use bias_core::AbortToken;
use bias_io::metrics::{
    init_metrics, serve_metrics, CURRENT, CYCLE_RUNNING, HEALTHY, OUTPUT_ON,
    SECONDS_SINCE_DEPOLARISATION, STATUS_INDEX, VOLTAGE,
};
use bias_io::{BiasSnapshot, StateExchange};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

const UPDATE_INTERVAL: Duration = Duration::from_millis(200);

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Copies the readback store into the gauges until `stop` trips.
pub fn start_metrics_updater(
    exchange: Arc<StateExchange>,
    stop: AbortToken,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.is_triggered() {
            publish_snapshot(&exchange.read_state());
            thread::sleep(UPDATE_INTERVAL);
        }
    })
}

fn publish_snapshot(snapshot: &BiasSnapshot) {
    VOLTAGE.set(snapshot.voltage);
    CURRENT.set(snapshot.current_ma);
    OUTPUT_ON.set(flag(snapshot.output_on));
    STATUS_INDEX.set(f64::from(snapshot.status.index()));
    HEALTHY.set(flag(snapshot.healthy));
    CYCLE_RUNNING.set(flag(snapshot.cycle_running));
    SECONDS_SINCE_DEPOLARISATION.set(snapshot.seconds_since_depolarisation as f64);
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
