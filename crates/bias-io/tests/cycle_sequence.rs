mod common;

use bias_core::{AbortToken, CycleConfig, Status};
use bias_io::{
    Command, ControlEvent, CycleController, CycleExit, DriverError, RampEngine, TransportError,
};
use common::{rig, wait_for_status};
use std::sync::Arc;
use std::time::Duration;

fn cycle(rig: &common::Rig) -> Arc<CycleController> {
    let engine = RampEngine::new(Arc::clone(&rig.instrument), Arc::clone(&rig.exchange));
    Arc::new(CycleController::new(
        engine,
        rig.config.clone(),
        Arc::clone(&rig.exchange),
    ))
}

#[tokio::test(start_paused = true)]
async fn two_repeats_visit_each_phase_twice_per_batch() {
    let config = CycleConfig {
        repeats: 2,
        hold_time: 1.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let cycle = cycle(&rig);
    let mut events = rig.exchange.subscribe();
    let token = AbortToken::new();

    let task = {
        let cycle = Arc::clone(&cycle);
        let token = token.clone();
        tokio::spawn(async move { cycle.run(&token).await })
    };

    let mut visited = Vec::new();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await.unwrap() {
                ControlEvent::StatusChanged { to, .. } => visited.push(to),
                ControlEvent::DepolarisationCompleted { repeats } => {
                    assert_eq!(repeats, 2);
                    break;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("first batch should complete");

    use Status::*;
    assert_eq!(
        visited,
        vec![
            RampDown, VoltageOn, RampUp, VoltageOff, RampDown, VoltageOn, RampUp, VoltageOff,
            RampDown, VoltageOn,
        ]
    );
    assert!(rig.exchange.cycle_running());
    assert_eq!(rig.sim.voltage(), -500.0);
    assert!(cycle.last_depolarisation().is_some());

    // Between batches the bias rests ON until max_time.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(rig.exchange.status(), VoltageOn);

    token.trigger();
    let exit = task.await.unwrap().unwrap();
    assert_eq!(exit, CycleExit::Aborted { depolarisations: 1 });
    assert_eq!(rig.exchange.status(), Hold);
    assert!(!rig.exchange.cycle_running());
}

#[tokio::test(start_paused = true)]
async fn zero_max_time_keeps_bias_on_after_batch() {
    let config = CycleConfig {
        max_time: 0.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let cycle = cycle(&rig);
    let mut events = rig.exchange.subscribe();
    let token = AbortToken::new();
    let task = {
        let cycle = Arc::clone(&cycle);
        let token = token.clone();
        tokio::spawn(async move { cycle.run(&token).await })
    };

    loop {
        if let ControlEvent::DepolarisationCompleted { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    rig.sim.clear_log();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(rig.sim.voltage_writes().is_empty());
    assert_eq!(rig.exchange.status(), Status::VoltageOn);

    token.trigger();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_during_ramp_up_holds_without_error() {
    let config = CycleConfig {
        rise_time: 10.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let controller = rig.controller();
    let mut events = rig.exchange.subscribe();

    controller.handle(Command::Depolarise).await.unwrap();
    wait_for_status(&mut events, Status::RampUp).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let before_stop = rig.sim.voltage();
    assert!(before_stop > -500.0 && before_stop < 0.0);

    controller.handle(Command::Stop).await.unwrap();

    assert_eq!(rig.exchange.status(), Status::Hold);
    assert!(!rig.exchange.cycle_running());
    assert!(!controller.is_busy().await);
    assert!(rig.sim.abort_count() >= 1);

    // The bias stays where the ramp left it.
    let held = rig.sim.voltage();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.sim.voltage(), held);

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        saw_fault |= matches!(event, ControlEvent::Fault { .. });
    }
    assert!(!saw_fault);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_moves_to_error() {
    let rig = rig(CycleConfig::default()).await;
    let cycle = cycle(&rig);
    let mut events = rig.exchange.subscribe();
    rig.sim.set_silent(true);

    let result = cycle.run(&AbortToken::new()).await;
    assert!(matches!(
        result,
        Err(DriverError::Transport(TransportError::Timeout(_)))
    ));
    assert_eq!(rig.exchange.status(), Status::Error);
    assert!(!rig.exchange.cycle_running());

    let mut saw_fault = false;
    while let Ok(event) = events.try_recv() {
        saw_fault |= matches!(event, ControlEvent::Fault { .. });
    }
    assert!(saw_fault);
}

#[tokio::test(start_paused = true)]
async fn later_phases_pick_up_config_changes() {
    let config = CycleConfig {
        hold_time: 5.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let cycle = cycle(&rig);
    let mut events = rig.exchange.subscribe();
    let token = AbortToken::new();
    let task = {
        let cycle = Arc::clone(&cycle);
        let token = token.clone();
        tokio::spawn(async move { cycle.run(&token).await })
    };

    wait_for_status(&mut events, Status::VoltageOn).await;
    rig.config
        .apply(&bias_core::ConfigUpdate {
            off_setpoint: Some(100.0),
            ..Default::default()
        })
        .unwrap();
    wait_for_status(&mut events, Status::VoltageOff).await;
    assert_eq!(rig.sim.voltage(), -100.0);

    token.trigger();
    task.await.unwrap().unwrap();
}
