//! Prometheus metrics for the bias supply.
//!
//! Readback gauges mirror the record-layer values; counters track ramps,
//! cycles, commands and failures.

use bias_core::tags;
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

// ============================================================================
// Readbacks
// ============================================================================

pub static VOLTAGE: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::VOLTAGE_RBV.metric, "Bias voltage readback in volts"));

pub static CURRENT: LazyLock<Gauge> =
    LazyLock::new(|| gauge(tags::CURRENT_RBV.metric, "Current readback in milliamps"));

pub static OUTPUT_ON: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::OUTPUT_RBV.metric,
        "Source output state (1=on, 0=off)",
    )
});

/// Status index (0=voltage-off,1=voltage-on,2=ramp-up,3=hold,4=ramp-down,5=error)
pub static STATUS_INDEX: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::STATUS.metric,
        "Bias status (0=off,1=on,2=ramp-up,3=hold,4=ramp-down,5=error)",
    )
});

pub static HEALTHY: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::HEALTHY.metric,
        "Bias is on and at the operating setpoint (1=healthy)",
    )
});

pub static CYCLE_RUNNING: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::CYCLE_RUNNING.metric,
        "Depolarisation cycle running (1=running)",
    )
});

pub static SECONDS_SINCE_DEPOLARISATION: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        tags::TIME_SINCE_DEPOLARISATION.metric,
        "Seconds since the bias last reached the off setpoint",
    )
});

// ============================================================================
// Control
// ============================================================================

pub static RAMPS_COMPLETED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("hvbias_ramps_completed_total", "Ramps that reached their target"));

pub static RAMPS_ABORTED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("hvbias_ramps_aborted_total", "Ramps stopped before their target"));

pub static RAMP_DURATION_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hvbias_ramp_duration_seconds",
            "Wall time of executed ramps in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

pub static CYCLES_STARTED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("hvbias_cycles_started_total", "Depolarisation cycles started"));

pub static DEPOLARISATIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "hvbias_depolarisations_completed_total",
        "Depolarisation batches completed",
    )
});

pub static COMMANDS_RECEIVED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("hvbias_commands_total", "Operator commands received"));

pub static COMMANDS_REFUSED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "hvbias_commands_refused_total",
        "Commands refused while the supply is in ERROR",
    )
});

// ============================================================================
// Failures
// ============================================================================

pub static READBACK_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "hvbias_readback_failures_total",
        "Poller readbacks skipped after a parse or transport failure",
    )
});

pub static FAULTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "hvbias_faults_total",
        "Operations that ended in ERROR status",
    )
});

// ============================================================================
// Connectivity
// ============================================================================

/// 1 once the instrument passed identification and setup.
pub static INSTRUMENT_READY: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "hvbias_instrument_ready",
        "Instrument identified and configured (1=ready)",
    )
});

pub static BRIDGE_CLIENTS: LazyLock<Gauge> =
    LazyLock::new(|| gauge("hvbias_bridge_clients", "Connected record-bridge clients"));

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Status, content type and body for one HTTP request.
struct Reply {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Reply {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }
}

/// Ready once the instrument has been identified and configured.
fn readiness() -> Reply {
    if INSTRUMENT_READY.get() > 0.0 {
        Reply::text(200, "Ready")
    } else {
        Reply::text(503, "Instrument not ready")
    }
}

fn scrape() -> Reply {
    let mut body = Vec::new();
    match TextEncoder::new().encode(&REGISTRY.gather(), &mut body) {
        Ok(()) => Reply {
            status: 200,
            content_type: "text/plain; version=0.0.4",
            body,
        },
        Err(err) => {
            tracing::warn!(error = %err, "Failed to encode metrics");
            Reply::text(500, "Internal Server Error")
        }
    }
}

fn respond_to(url: &str) -> Reply {
    match url {
        "/metrics" => scrape(),
        "/health" => Reply::text(200, "OK"),
        "/ready" => readiness(),
        _ => Reply::text(404, "Not Found"),
    }
}

/// Serves `/metrics`, `/health` and `/ready` on a dedicated thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(addr = %bind_addr, error = %e, "Failed to start metrics server");
                return;
            }
        };
        tracing::info!(addr = %bind_addr, "Metrics server listening");

        for request in server.incoming_requests() {
            let reply = respond_to(request.url());
            let mut response = Response::from_data(reply.body).with_status_code(reply.status);
            if let Ok(header) =
                Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
            {
                response = response.with_header(header);
            }
            if let Err(err) = request.respond(response) {
                tracing::debug!(error = %err, "Metrics client went away");
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = VOLTAGE.get();
    let _ = CURRENT.get();
    let _ = OUTPUT_ON.get();
    let _ = STATUS_INDEX.get();
    let _ = HEALTHY.get();
    let _ = CYCLE_RUNNING.get();
    let _ = SECONDS_SINCE_DEPOLARISATION.get();
    let _ = RAMPS_COMPLETED.get();
    let _ = RAMPS_ABORTED.get();
    let _ = RAMP_DURATION_SECONDS.get_sample_count();
    let _ = CYCLES_STARTED.get();
    let _ = DEPOLARISATIONS_COMPLETED.get();
    let _ = COMMANDS_RECEIVED.get();
    let _ = COMMANDS_REFUSED.get();
    let _ = READBACK_FAILURES.get();
    let _ = FAULTS.get();
    let _ = INSTRUMENT_READY.get();
    let _ = BRIDGE_CLIENTS.get();
}
