#![allow(dead_code)]

use bias_core::{CycleConfig, SharedCycleConfig, Status};
use bias_io::{
    BiasController, ControlEvent, DeviceLink, Keithley, SharedInstrument, SimHandle,
    SimulatedSource, StateExchange, DEFAULT_MODEL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Rig {
    pub instrument: SharedInstrument,
    pub sim: SimHandle,
    pub exchange: Arc<StateExchange>,
    pub config: SharedCycleConfig,
}

pub async fn rig(config: CycleConfig) -> Rig {
    let (source, sim) = SimulatedSource::new();
    let link = DeviceLink::new(source, READ_TIMEOUT);
    let instrument = Keithley::connect(link, DEFAULT_MODEL)
        .await
        .expect("simulated instrument should connect")
        .into_shared();
    Rig {
        instrument,
        sim,
        exchange: Arc::new(StateExchange::new()),
        config: SharedCycleConfig::new(config),
    }
}

impl Rig {
    pub fn controller(&self) -> Arc<BiasController> {
        Arc::new(BiasController::new(
            Arc::clone(&self.instrument),
            self.config.clone(),
            Arc::clone(&self.exchange),
        ))
    }
}

/// Waits (in simulated time) for a transition into `target`.
pub async fn wait_for_status(events: &mut broadcast::Receiver<ControlEvent>, target: Status) {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(ControlEvent::StatusChanged { to, .. }) if to == target => return,
                Ok(_) => {}
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("status transition should happen");
}

/// Waits until the controller has no running operation.
pub async fn wait_idle(controller: &BiasController) {
    tokio::time::timeout(Duration::from_secs(600), async {
        while controller.is_busy().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation should finish");
}
