use crate::infra::audit::{forward_events, AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use bias_core::{AbortToken, ConfigError, CycleConfig, SharedCycleConfig, TimeBase};
use bias_io::metrics::INSTRUMENT_READY;
use bias_io::{
    open_serial, run_commands, serve_bridge, BiasController, Command, DeviceLink, DriverError,
    Keithley, Poller, SharedInstrument, SimulatedSource, StateExchange, TransportError,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Poller-originated commands waiting for the command loop.
const COMMAND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to read cycle configuration {path}: {source}")]
    ReadCycleConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid cycle configuration {path}: {source}")]
    CycleConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to bind record bridge on {addr}: {source}")]
    Bridge {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    if config.show_version {
        println!("hv-bias {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "hv-bias stopped with an error");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("hv-bias")
        .build()
        .map_err(AppError::Runtime)?;
    runtime.block_on(serve(config))
}

async fn serve(config: RuntimeConfig) -> Result<(), AppError> {
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);

    let timebase = TimeBase::new();
    let cycle_config = load_cycle_config(config.cycle_config_path.as_deref())?;
    let audit_logger = init_audit_logger(config.audit_path.as_deref())?;

    if let Some(logger) = &audit_logger {
        let _ = logger.log_event(
            &timebase,
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "simulate": config.simulate,
                "port": config.port,
                "bridge_enabled": config.bridge_enabled,
                "metrics_enabled": config.metrics_addr.is_some(),
                "cycle_config": cycle_config,
            }),
        );
    }

    let instrument = connect_instrument(&config).await?;
    if let Some(logger) = &audit_logger {
        let _ = logger.log_event(
            &timebase,
            AuditEventType::InstrumentConnected,
            serde_json::json!({
                "expected_model": config.expect_model,
                "identity": instrument.lock().await.last_response(),
            }),
        );
    }

    let exchange = Arc::new(StateExchange::new());
    let shared_config = SharedCycleConfig::new(cycle_config);
    let controller = Arc::new(BiasController::new(
        Arc::clone(&instrument),
        shared_config.clone(),
        Arc::clone(&exchange),
    ));
    let shutdown = AbortToken::new();

    let audit_task = audit_logger.as_ref().map(|logger| {
        tokio::spawn(forward_events(
            Arc::clone(logger),
            exchange.subscribe(),
            timebase,
            shutdown.clone(),
        ))
    });

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let command_task = tokio::spawn(run_commands(Arc::clone(&controller), command_rx));

    info!(
        poll_ms = config.poll_interval().as_millis() as u64,
        max_time_s = cycle_config.max_time,
        "Starting readback poller"
    );
    let poller = Poller::new(instrument, shared_config, Arc::clone(&exchange))
        .with_interval(config.poll_interval())
        .with_commands(command_tx);
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));

    let bridge_task = if config.bridge_enabled {
        let bridge_config = config.bridge_config();
        let listener = TcpListener::bind(&bridge_config.bind_addr)
            .await
            .map_err(|source| AppError::Bridge {
                addr: bridge_config.bind_addr.clone(),
                source,
            })?;
        Some(tokio::spawn(serve_bridge(
            listener,
            Arc::clone(&controller),
            timebase,
            bridge_config,
            shutdown.clone(),
        )))
    } else {
        info!("Bridge disabled");
        None
    };

    let updater = telemetry::start_metrics_updater(Arc::clone(&exchange), shutdown.clone());

    info!("hv-bias running");
    wait_for_shutdown(config.run_seconds).await;

    // Leave the supply holding wherever a running ramp or cycle got to.
    if controller.is_busy().await {
        if let Err(err) = controller.handle(Command::Stop).await {
            warn!(error = %err, "Stop on shutdown failed");
        }
    }
    shutdown.trigger();

    // The command loop ends once the poller drops its sender.
    let _ = poller_task.await;
    let _ = command_task.await;
    if let Some(task) = bridge_task {
        let _ = task.await;
    }
    if let Some(task) = audit_task {
        let _ = task.await;
    }
    let _ = tokio::task::spawn_blocking(move || updater.join()).await;
    INSTRUMENT_READY.set(0.0);

    let snapshot = exchange.read_state();
    info!(
        uptime_s = timebase.uptime().as_secs(),
        status = %snapshot.status,
        voltage = snapshot.voltage,
        "Run complete"
    );
    if let Some(logger) = &audit_logger {
        let _ = logger.log_event(
            &timebase,
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "uptime_s": timebase.uptime().as_secs(),
                "status": snapshot.status,
                "voltage": snapshot.voltage,
            }),
        );
    }
    Ok(())
}

async fn connect_instrument(config: &RuntimeConfig) -> Result<SharedInstrument, AppError> {
    let link = if config.simulate {
        info!("Using simulated instrument");
        let (source, _handle) = SimulatedSource::new();
        DeviceLink::new(source, config.read_timeout())
    } else {
        let settings = config.serial_settings();
        info!(port = %settings.path, baud = settings.baud_rate, "Opening serial link");
        open_serial(&settings)?
    };

    let instrument = Keithley::connect(link, &config.expect_model).await?;
    INSTRUMENT_READY.set(1.0);
    Ok(instrument.into_shared())
}

async fn wait_for_shutdown(run_seconds: Option<u64>) {
    let limit = async {
        match run_seconds {
            Some(seconds) => {
                info!(seconds, "Running for limited duration");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(err) => {
                warn!(error = %err, "Cannot listen for interrupts");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = limit => {}
        _ = interrupt => {}
    }
}

fn load_cycle_config(path: Option<&Path>) -> Result<CycleConfig, AppError> {
    let Some(path) = path else {
        return Ok(CycleConfig::default());
    };
    let text = std::fs::read_to_string(path).map_err(|source| AppError::ReadCycleConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let config = CycleConfig::from_json(&text).map_err(|source| AppError::CycleConfig {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), ?config, "Cycle configuration loaded");
    Ok(config)
}

fn init_audit_logger(path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}
