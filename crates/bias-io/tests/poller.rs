mod common;

use bias_core::{CycleConfig, Status};
use bias_io::{run_commands, Command, Poller};
use common::{rig, wait_idle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn poller(rig: &common::Rig) -> Poller {
    Poller::new(
        Arc::clone(&rig.instrument),
        rig.config.clone(),
        Arc::clone(&rig.exchange),
    )
}

#[tokio::test(start_paused = true)]
async fn healthy_when_on_and_at_setpoint() {
    let rig = rig(CycleConfig::default()).await;
    let mut poller = poller(&rig);
    rig.instrument.lock().await.source_on().await.unwrap();
    rig.sim.set_voltage(-500.0);

    let sample = poller.poll_once().await;
    assert_eq!(sample.voltage, Some(-500.0));
    assert_eq!(sample.output_on, Some(true));
    assert!(sample.healthy);
    assert!((sample.current_ma.unwrap() - 0.05).abs() < 1e-9);

    let state = rig.exchange.read_state();
    assert!(state.healthy);
    assert_eq!(state.voltage, -500.0);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_when_output_off_or_off_setpoint() {
    let rig = rig(CycleConfig::default()).await;
    let mut poller = poller(&rig);
    rig.sim.set_voltage(-500.0);
    assert!(!poller.poll_once().await.healthy);

    rig.instrument.lock().await.source_on().await.unwrap();
    rig.sim.set_voltage(-499.0);
    assert!(!poller.poll_once().await.healthy);
}

#[tokio::test(start_paused = true)]
async fn parse_failure_skips_one_readback() {
    let rig = rig(CycleConfig::default()).await;
    let mut poller = poller(&rig);
    rig.sim.set_voltage(-250.0);
    poller.poll_once().await;

    rig.sim.inject_reply("-113,\"Undefined header\"");
    let sample = poller.poll_once().await;
    assert_eq!(sample.voltage, None);
    assert!(sample.current_ma.is_some());
    assert!(!sample.healthy);
    // The previous reading stays published.
    assert_eq!(rig.exchange.read_state().voltage, -250.0);

    let sample = poller.poll_once().await;
    assert_eq!(sample.voltage, Some(-250.0));
}

#[tokio::test(start_paused = true)]
async fn timer_resets_at_off_setpoint() {
    let rig = rig(CycleConfig::default()).await;
    let mut poller = poller(&rig);

    rig.sim.set_voltage(0.0);
    assert_eq!(poller.poll_once().await.seconds_since_depolarisation, 0);

    rig.sim.set_voltage(-500.0);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(poller.poll_once().await.seconds_since_depolarisation, 3);
    assert_eq!(rig.exchange.read_state().seconds_since_depolarisation, 3);

    rig.sim.set_voltage(0.0);
    assert_eq!(poller.poll_once().await.seconds_since_depolarisation, 0);
}

#[tokio::test(start_paused = true)]
async fn overdue_depolarisation_is_requested_once() {
    let config = CycleConfig {
        max_time: 2.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let controller = rig.controller();
    controller.handle(Command::RampOn).await.unwrap();
    wait_idle(&controller).await;
    assert_eq!(rig.exchange.status(), Status::VoltageOn);

    let (tx, mut rx) = mpsc::channel(4);
    let mut poller = poller(&rig).with_commands(tx);
    assert!(!poller.poll_once().await.depolarise_requested);
    tokio::time::advance(Duration::from_secs(3)).await;

    assert!(poller.poll_once().await.depolarise_requested);
    assert_eq!(rx.try_recv().unwrap(), Command::Depolarise);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!poller.poll_once().await.depolarise_requested);
    assert!(rx.try_recv().is_err());
}

/// Polls every 500 ms for `seconds` with the command loop attached,
/// returning whether any poll requested a depolarisation.
async fn poll_for(rig: &common::Rig, seconds: u64) -> bool {
    let (tx, rx) = mpsc::channel(4);
    let commands = tokio::spawn(run_commands(rig.controller(), rx));
    let mut poller = poller(rig).with_commands(tx);
    let mut requested = false;
    for _ in 0..seconds * 2 {
        requested |= poller.poll_once().await.depolarise_requested;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    drop(poller);
    commands.await.unwrap();
    requested
}

#[tokio::test(start_paused = true)]
async fn output_off_is_not_undone_by_max_time() {
    let config = CycleConfig {
        max_time: 60.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let controller = rig.controller();
    controller.handle(Command::RampOn).await.unwrap();
    wait_idle(&controller).await;
    controller.handle(Command::OutputOff).await.unwrap();
    assert!(!rig.sim.output_on());
    // The programmed setpoint still reads back with the output off.
    assert_eq!(rig.sim.voltage(), -500.0);

    assert!(!poll_for(&rig, 100).await);
    assert!(!rig.sim.output_on());
    assert!(!rig.exchange.cycle_running());
    assert_eq!(rig.exchange.status(), Status::VoltageOff);
}

#[tokio::test(start_paused = true)]
async fn stop_is_not_undone_by_max_time() {
    let config = CycleConfig {
        max_time: 60.0,
        fall_time: 30.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let controller = rig.controller();
    controller.handle(Command::RampOn).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    controller.handle(Command::Stop).await.unwrap();
    assert_eq!(rig.exchange.status(), Status::Hold);
    let held_at = rig.sim.voltage();

    assert!(!poll_for(&rig, 100).await);
    assert_eq!(rig.exchange.status(), Status::Hold);
    assert!(!rig.exchange.cycle_running());
    assert_eq!(rig.sim.voltage(), held_at);
}

#[tokio::test(start_paused = true)]
async fn no_request_while_cycle_running() {
    let config = CycleConfig {
        max_time: 2.0,
        ..CycleConfig::default()
    };
    let rig = rig(config).await;
    let (tx, mut rx) = mpsc::channel(4);
    let mut poller = poller(&rig).with_commands(tx);
    rig.exchange.set_cycle_running(true);
    rig.sim.set_voltage(-500.0);
    tokio::time::advance(Duration::from_secs(5)).await;

    assert!(!poller.poll_once().await.depolarise_requested);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_shutdown() {
    let rig = rig(CycleConfig::default()).await;
    let shutdown = bias_core::AbortToken::new();
    let task = tokio::spawn(
        poller(&rig)
            .with_interval(Duration::from_millis(100))
            .run(shutdown.clone()),
    );
    rig.sim.set_voltage(-42.0);
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(rig.exchange.read_state().voltage, -42.0);
    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("poller should stop")
        .unwrap();
}
