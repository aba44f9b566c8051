//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "tests"
//! mtr_type: "test"
//! mtr_scope: "code"
//! mtr_description: "Hub lifecycle tests against simulated links."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use mtr_common::{AppConfig, Mode};
use mtr_core::{EepromLayout, EepromRecord, HubHandle, MotorLinkStatus, MtrHub};
use mtr_links::sim::{I2cOp, SimulatedLinks};
use mtr_links::Level;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, timeout, Instant};

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.mode = Mode::Simulation;
    config.server.listen = "127.0.0.1:0".parse().unwrap();
    config.status.tick = Duration::from_millis(20);
    config.motor.reconnect_settle = Duration::from_millis(10);
    config.eeprom.retry_backoff = Duration::from_millis(1);
    config.eeprom.write_cycle = Duration::from_millis(1);
    config.rf.response_window = Duration::from_millis(1);
    config
}

async fn start(links: &SimulatedLinks) -> HubHandle {
    MtrHub::new(test_config(), links.link_set(), None)
        .start()
        .await
        .unwrap()
}

async fn next_message(rx: &mut Receiver<Arc<str>>) -> Value {
    let text = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within timeout")
        .expect("session open");
    serde_json::from_str(&text).unwrap()
}

async fn wait_for_status<F>(rx: &mut Receiver<Arc<str>>, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        assert!(Instant::now() < deadline, "status condition not reached");
        let message = next_message(rx).await;
        if message["type"] == "status" && predicate(&message["data"]) {
            return message;
        }
    }
}

#[tokio::test]
async fn startup_connects_motor_and_sends_rf_setup() {
    let links = SimulatedLinks::new();
    let hub = start(&links).await;

    assert_eq!(hub.motor().status(), MotorLinkStatus::Connected);
    assert_eq!(links.motor.connect_attempts(), 1);
    assert_eq!(links.rf.written()[0], hex::decode("020901430100014903").unwrap());

    let status = hub.status();
    assert!(status.motor_connected);
    assert!(status.rf_connected);
    assert_eq!(status.pins["gpio17"], "LOW");

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_motor_shows_in_status_until_it_returns() {
    let links = SimulatedLinks::new();
    let hub = start(&links).await;
    let (_, mut rx) = hub.registry().add();

    wait_for_status(&mut rx, |data| data["motor_connected"] == true).await;

    links.motor.set_reachable(false);
    links.motor.drop_link();
    let status = wait_for_status(&mut rx, |data| data["motor_connected"] == false).await;
    assert!(status["data"].get("position").is_none());

    wait_for_status(&mut rx, |data| data["motor_link"] == "reconnect_exhausted").await;
    assert!(links.motor.connect_attempts() >= 1 + 3);

    links.motor.set_reachable(true);
    wait_for_status(&mut rx, |data| data["motor_connected"] == true).await;

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_increments_do_not_interleave() {
    let links = SimulatedLinks::new();
    let hub = start(&links).await;
    let store = hub.eeprom();
    let layout = EepromLayout::MTR20_CLASSYS;
    store
        .write(
            layout,
            EepromRecord {
                tip_type: 2,
                shot_count: 100,
                year: 2024,
                month: 5,
                day: 6,
                maker: 7,
            },
        )
        .await
        .unwrap();
    links.i2c.clear_journal();

    let (first, second) = tokio::join!(
        store.increment_shot_count(layout),
        store.increment_shot_count(layout)
    );
    let mut counts = vec![first.unwrap().shot_count, second.unwrap().shot_count];
    counts.sort_unstable();
    assert_eq!(counts, vec![101, 102]);

    let pattern: Vec<bool> = links.i2c.journal().iter().map(I2cOp::is_write).collect();
    let one_increment: Vec<bool> = std::iter::repeat(false)
        .take(6)
        .chain(std::iter::repeat(true).take(7))
        .chain(std::iter::repeat(false).take(6))
        .collect();
    assert_eq!(pattern, [one_increment.clone(), one_increment].concat());

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn gpio_edges_arrive_in_order_before_the_snapshot() {
    let links = SimulatedLinks::new();
    let hub = start(&links).await;
    let (_, mut rx) = hub.registry().add();
    wait_for_status(&mut rx, |_| true).await;

    let needle = links.gpio.input_pin(17);
    for level in [Level::High, Level::Low, Level::High, Level::Low, Level::High] {
        needle.drive(level);
    }
    needle.flush();

    let mut levels = Vec::new();
    loop {
        let message = next_message(&mut rx).await;
        match message["type"].as_str() {
            Some("gpio17_status") => levels.push(message["gpio17"].as_str().unwrap().to_owned()),
            Some("status") if levels.len() == 5 => {
                assert_eq!(message["data"]["needle_tip_connected"], true);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(levels, vec!["HIGH", "LOW", "HIGH", "LOW", "HIGH"]);

    hub.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_releases_links_and_sessions() {
    let links = SimulatedLinks::new();
    let hub = start(&links).await;
    let (_, mut rx) = hub.registry().add();
    let registry = hub.registry();

    hub.shutdown().await.unwrap();

    assert!(registry.is_empty());
    assert_eq!(links.motor.disconnect_calls(), 1);
    assert!(!links.rf.is_open());
    assert_eq!(links.gpio.output_pin(0).history().last(), Some(&false));
    sleep(Duration::from_millis(10)).await;
    while rx.try_recv().is_ok() {}
    assert!(rx.recv().await.is_none());
}
