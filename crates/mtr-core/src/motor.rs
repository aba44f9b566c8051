//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Supervision of the motor link.
//!
//! The supervisor is the only owner of the [`MotorDriver`]. Client commands go
//! through it, and the status loop polls it once per tick. A link that drops
//! while connected is re-established in the background by a single reconnect
//! task with a bounded number of attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mtr_common::MotorConfig;
use mtr_links::{LinkError, MotorDriver, MotorReadings, SerialParams};
use mtr_metrics::HubMetrics;
use mtr_msg::MotorSnapshot;
use mtr_resilience::RetryPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

type SharedDriver = Arc<tokio::sync::Mutex<Box<dyn MotorDriver>>>;

/// Where the supervisor stands with the motor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorLinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ReconnectExhausted,
}

impl MotorLinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotorLinkStatus::Disconnected => "disconnected",
            MotorLinkStatus::Connecting => "connecting",
            MotorLinkStatus::Connected => "connected",
            MotorLinkStatus::Reconnecting => "reconnecting",
            MotorLinkStatus::ReconnectExhausted => "reconnect_exhausted",
        }
    }
}

impl std::fmt::Display for MotorLinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    driver: Option<SharedDriver>,
    status: Mutex<MotorLinkStatus>,
    exhausted_published: AtomicBool,
    readings: Mutex<Option<MotorReadings>>,
    policy: RetryPolicy,
    settle: Duration,
    auto_params: SerialParams,
    metrics: Option<HubMetrics>,
}

impl Inner {
    fn status(&self) -> MotorLinkStatus {
        *self.status.lock()
    }

    fn set_status(&self, next: MotorLinkStatus) {
        if next == MotorLinkStatus::ReconnectExhausted {
            self.exhausted_published.store(false, Ordering::SeqCst);
        }
        let previous = std::mem::replace(&mut *self.status.lock(), next);
        if previous != next {
            info!(from = %previous, to = %next, "motor link status changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_motor_connected(next == MotorLinkStatus::Connected);
        }
    }

    async fn reconnect(self: Arc<Self>, driver: SharedDriver) {
        let outcome = self
            .policy
            .run("motor_reconnect", |attempt| {
                let inner = self.clone();
                let driver = driver.clone();
                async move { inner.reconnect_attempt(&driver, attempt).await }
            })
            .await;
        match outcome {
            Ok(done) => {
                info!(attempts = done.attempts, "motor link re-established");
                *self.readings.lock() = Some(done.value);
                self.set_status(MotorLinkStatus::Connected);
            }
            Err(exhausted) => {
                warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last,
                    "motor reconnect exhausted"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.motor_reconnect_exhausted();
                }
                *self.readings.lock() = None;
                self.set_status(MotorLinkStatus::ReconnectExhausted);
            }
        }
    }

    async fn reconnect_attempt(
        &self,
        driver: &SharedDriver,
        attempt: usize,
    ) -> Result<MotorReadings, LinkError> {
        if let Some(metrics) = &self.metrics {
            metrics.motor_reconnect_attempt();
        }
        {
            let mut driver = driver.lock().await;
            if let Err(err) = driver.disconnect() {
                debug!(attempt, error = %err, "disconnect before reconnect failed");
            }
        }
        sleep(self.settle).await;
        let mut driver = driver.lock().await;
        let message = driver.connect(&self.auto_params)?;
        if !driver.is_connected() {
            return Err(LinkError::Connect(format!(
                "driver reported no link after connect ({message})"
            )));
        }
        debug!(attempt, %message, "motor reconnect attempt succeeded");
        Ok(driver.readings())
    }
}

/// Owner of the motor link and its reconnect state machine.
pub struct MotorSupervisor {
    inner: Arc<Inner>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl MotorSupervisor {
    pub fn new(
        driver: Option<Box<dyn MotorDriver>>,
        config: &MotorConfig,
        metrics: Option<HubMetrics>,
    ) -> Self {
        if driver.is_none() {
            warn!("no motor driver available; motor commands will fail");
        }
        let auto_params = SerialParams {
            port: config.port.clone(),
            baudrate: config.baudrate,
            parity: config.parity.clone(),
            databits: config.databits,
            stopbits: config.stopbits,
        };
        Self {
            inner: Arc::new(Inner {
                driver: driver.map(|driver| Arc::new(tokio::sync::Mutex::new(driver))),
                status: Mutex::new(MotorLinkStatus::Disconnected),
                exhausted_published: AtomicBool::new(false),
                readings: Mutex::new(None),
                policy: RetryPolicy::new(config.reconnect_attempts, Duration::ZERO)
                    .with_jitter(config.reconnect_jitter),
                settle: config.reconnect_settle,
                auto_params,
                metrics,
            }),
            reconnect: Mutex::new(None),
        }
    }

    pub fn status(&self) -> MotorLinkStatus {
        self.inner.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == MotorLinkStatus::Connected
    }

    /// Readings from the last poll, present only while connected.
    pub fn snapshot(&self) -> Option<MotorSnapshot> {
        if !self.is_connected() {
            return None;
        }
        self.inner.readings.lock().map(|readings| MotorSnapshot {
            position: readings.position,
            force: readings.force,
            sensor: readings.sensor,
            set_pos: readings.set_pos,
        })
    }

    /// Open the link with client-supplied settings. A failure is reported and
    /// leaves the link disconnected.
    pub async fn connect(&self, params: SerialParams) -> Result<String, LinkError> {
        let driver = self.driver()?;
        self.cancel_reconnect();
        self.inner.set_status(MotorLinkStatus::Connecting);
        let mut driver = driver.lock().await;
        match driver.connect(&params) {
            Ok(message) if driver.is_connected() => {
                *self.inner.readings.lock() = Some(driver.readings());
                self.inner.set_status(MotorLinkStatus::Connected);
                info!(port = %params.port, baudrate = params.baudrate, "motor connected");
                Ok(message)
            }
            Ok(message) => {
                self.inner.set_status(MotorLinkStatus::Disconnected);
                Err(LinkError::Connect(format!(
                    "driver reported no link after connect ({message})"
                )))
            }
            Err(err) => {
                self.inner.set_status(MotorLinkStatus::Disconnected);
                warn!(port = %params.port, error = %err, "motor connect failed");
                Err(err)
            }
        }
    }

    /// Connect with the configured automatic settings. A failure hands the link
    /// to the reconnect loop on the next poll.
    pub async fn auto_connect(&self) -> Result<String, LinkError> {
        let params = self.inner.auto_params.clone();
        let outcome = self.connect(params).await;
        if outcome.is_err() && self.inner.driver.is_some() {
            self.inner.set_status(MotorLinkStatus::ReconnectExhausted);
        }
        outcome
    }

    pub async fn disconnect(&self) -> Result<String, LinkError> {
        let driver = self.driver()?;
        self.cancel_reconnect();
        let mut driver = driver.lock().await;
        let outcome = driver.disconnect();
        *self.inner.readings.lock() = None;
        self.inner.set_status(MotorLinkStatus::Disconnected);
        outcome
    }

    pub async fn move_to(&self, position: i64, mode: &str) -> Result<String, LinkError> {
        let driver = self.driver()?;
        let mut driver = driver.lock().await;
        let message = driver.move_to(position, mode)?;
        debug!(position, mode, "motor move accepted");
        Ok(message)
    }

    /// Sample the driver once. Called from the status loop.
    ///
    /// Skips the sample while a command or reconnect attempt holds the link.
    /// A drop detected while connected starts a reconnect run unless one is in
    /// flight. An exhausted run stays visible for one poll; the poll after
    /// that starts a fresh run if the link is still down.
    pub fn poll(&self) {
        let Some(driver) = &self.inner.driver else {
            return;
        };
        let Ok(guard) = driver.try_lock() else {
            return;
        };
        let connected = guard.is_connected();
        let readings = guard.readings();
        drop(guard);

        match (self.status(), connected) {
            (MotorLinkStatus::Connected, true) => {
                *self.inner.readings.lock() = Some(readings);
            }
            (MotorLinkStatus::Disconnected | MotorLinkStatus::ReconnectExhausted, true) => {
                *self.inner.readings.lock() = Some(readings);
                self.inner.set_status(MotorLinkStatus::Connected);
            }
            (MotorLinkStatus::Connected, false) => {
                self.spawn_reconnect(driver.clone());
            }
            (MotorLinkStatus::ReconnectExhausted, false) => {
                if self.inner.exhausted_published.swap(true, Ordering::SeqCst) {
                    self.spawn_reconnect(driver.clone());
                }
            }
            _ => {}
        }
    }

    fn spawn_reconnect(&self, driver: SharedDriver) {
        let mut slot = self.reconnect.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        warn!("motor link lost; reconnecting");
        *self.inner.readings.lock() = None;
        self.inner.set_status(MotorLinkStatus::Reconnecting);
        *slot = Some(tokio::spawn(self.inner.clone().reconnect(driver)));
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            if !task.is_finished() {
                debug!("cancelling motor reconnect");
                task.abort();
            }
        }
    }

    /// Whether a reconnect run is in flight.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop reconnecting and release the link.
    pub async fn shutdown(&self) {
        self.cancel_reconnect();
        let Some(driver) = &self.inner.driver else {
            return;
        };
        let mut driver = driver.lock().await;
        if driver.is_connected() {
            if let Err(err) = driver.disconnect() {
                warn!(error = %err, "motor disconnect at shutdown failed");
            }
        }
        *self.inner.readings.lock() = None;
        self.inner.set_status(MotorLinkStatus::Disconnected);
    }

    fn driver(&self) -> Result<SharedDriver, LinkError> {
        self.inner
            .driver
            .clone()
            .ok_or(LinkError::Unavailable("motor"))
    }
}

impl std::fmt::Debug for MotorSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorSupervisor")
            .field("status", &self.status())
            .field("available", &self.inner.driver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtr_common::{Classify, ErrorKind};
    use mtr_links::sim::SimMotor;

    fn supervisor(motor: &SimMotor) -> MotorSupervisor {
        MotorSupervisor::new(Some(Box::new(motor.clone())), &MotorConfig::default(), None)
    }

    async fn settle_for(duration: Duration) {
        sleep(duration).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_failure_is_not_retried() {
        let motor = SimMotor::new();
        motor.set_reachable(false);
        let supervisor = supervisor(&motor);

        let err = supervisor.connect(SerialParams::auto()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert_eq!(supervisor.status(), MotorLinkStatus::Disconnected);

        supervisor.poll();
        settle_for(Duration::from_secs(10)).await;
        assert_eq!(motor.connect_attempts(), 1);
        assert!(supervisor.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_is_recovered_in_background() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();
        assert!(supervisor.snapshot().is_some());

        motor.drop_link();
        supervisor.poll();
        assert_eq!(supervisor.status(), MotorLinkStatus::Reconnecting);
        assert!(supervisor.snapshot().is_none());

        settle_for(Duration::from_millis(1_100)).await;
        assert_eq!(supervisor.status(), MotorLinkStatus::Connected);
        assert_eq!(motor.connect_attempts(), 2);
        assert_eq!(motor.disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_link_has_readings_before_the_next_poll() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();
        motor.set_readings(MotorReadings {
            position: 42.0,
            force: 1.5,
            sensor: 3.0,
            set_pos: 40.0,
        });

        motor.drop_link();
        supervisor.poll();
        settle_for(Duration::from_millis(1_100)).await;

        assert_eq!(supervisor.status(), MotorLinkStatus::Connected);
        let snapshot = supervisor.snapshot().expect("readings after reconnect");
        assert_eq!(snapshot.position, 42.0);
        assert_eq!(snapshot.set_pos, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_three_attempts() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();

        motor.set_reachable(false);
        motor.drop_link();
        supervisor.poll();
        supervisor.poll();
        assert!(supervisor.is_reconnecting());

        settle_for(Duration::from_secs(5)).await;
        assert_eq!(supervisor.status(), MotorLinkStatus::ReconnectExhausted);
        assert!(!supervisor.is_connected());
        assert_eq!(motor.connect_attempts(), 1 + 3);

        settle_for(Duration::from_secs(30)).await;
        assert_eq!(motor.connect_attempts(), 1 + 3);

        supervisor.poll();
        assert_eq!(supervisor.status(), MotorLinkStatus::ReconnectExhausted);
        supervisor.poll();
        assert_eq!(supervisor.status(), MotorLinkStatus::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_stays_down() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();
        supervisor.disconnect().await.unwrap();
        supervisor.poll();
        settle_for(Duration::from_secs(5)).await;
        assert_eq!(supervisor.status(), MotorLinkStatus::Disconnected);
        assert_eq!(motor.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_cancels_reconnect() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();
        motor.drop_link();
        supervisor.poll();
        assert!(supervisor.is_reconnecting());

        supervisor.connect(SerialParams::auto()).await.unwrap();
        assert!(!supervisor.is_reconnecting());
        settle_for(Duration::from_secs(5)).await;
        assert_eq!(supervisor.status(), MotorLinkStatus::Connected);
        assert_eq!(motor.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_jitter_spaces_out_attempts() {
        let motor = SimMotor::new();
        let config = MotorConfig {
            reconnect_jitter: Duration::from_millis(300),
            ..MotorConfig::default()
        };
        let supervisor = MotorSupervisor::new(Some(Box::new(motor.clone())), &config, None);
        assert_eq!(supervisor.inner.policy.jitter, Duration::from_millis(300));
        supervisor.connect(SerialParams::auto()).await.unwrap();

        motor.set_reachable(false);
        motor.drop_link();
        supervisor.poll();
        // Three settles plus at most two jittered pauses.
        settle_for(Duration::from_millis(3_700)).await;
        assert_eq!(supervisor.status(), MotorLinkStatus::ReconnectExhausted);
        assert_eq!(motor.connect_attempts(), 1 + 3);
    }

    #[tokio::test]
    async fn moves_reach_the_driver() {
        let motor = SimMotor::new();
        let supervisor = supervisor(&motor);
        supervisor.connect(SerialParams::auto()).await.unwrap();
        supervisor.move_to(1200, "position").await.unwrap();
        supervisor.poll();
        assert_eq!(motor.moves(), vec![(1200, "position".to_owned())]);
        assert_eq!(supervisor.snapshot().unwrap().set_pos, 1200.0);
    }

    #[tokio::test]
    async fn missing_driver_reports_unavailable() {
        let supervisor = MotorSupervisor::new(None, &MotorConfig::default(), None);
        let err = supervisor.move_to(1, "position").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LinkUnavailable);
        supervisor.poll();
        assert_eq!(supervisor.status(), MotorLinkStatus::Disconnected);
    }
}
