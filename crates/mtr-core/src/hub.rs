//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Hub lifecycle: builds every component from the links handed in at start,
//! runs the server and the status loop, and releases the links on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use mtr_common::{AppConfig, Classify, ErrorKind, Mode};
use mtr_links::LinkSet;
use mtr_metrics::HubMetrics;
use mtr_msg::StatusData;
use mtr_net::{SessionRegistry, WebSocketServerBuilder, WebSocketServerHandle};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broadcast::StatusBroadcaster;
use crate::dispatch::Dispatcher;
use crate::eeprom::EepromStore;
use crate::gpio::GpioBridge;
use crate::motor::MotorSupervisor;
use crate::rf::RfLink;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("websocket server failed to start on {addr}: {reason}")]
    Server { addr: SocketAddr, reason: String },
    #[error("hub task failed: {0}")]
    Task(String),
}

impl Classify for HubError {
    fn kind(&self) -> ErrorKind {
        match self {
            HubError::Server { .. } => ErrorKind::ConnectFailure,
            HubError::Task(_) => ErrorKind::TransactionFailure,
        }
    }
}

/// Everything the hub needs before it starts.
pub struct MtrHub {
    config: Arc<AppConfig>,
    links: LinkSet,
    metrics: Option<HubMetrics>,
}

impl MtrHub {
    pub fn new(config: AppConfig, links: LinkSet, metrics: Option<HubMetrics>) -> Self {
        Self {
            config: Arc::new(config),
            links,
            metrics,
        }
    }

    /// Bring up the links, the server and the status loop.
    pub async fn start(self) -> Result<HubHandle, HubError> {
        let config = self.config;
        let metrics = self.metrics;
        info!(mode = ?config.mode, links = ?self.links.present(), "starting hub");
        let LinkSet {
            motor,
            rf,
            i2c,
            gpio,
        } = self.links;

        let components = Components {
            motor: Arc::new(MotorSupervisor::new(motor, &config.motor, metrics.clone())),
            eeprom: Arc::new(EepromStore::new(i2c, &config.eeprom, metrics.clone())),
            rf: Arc::new(RfLink::new(rf, &config.rf, metrics.clone())),
            gpio: Arc::new(GpioBridge::start(gpio, &config.gpio, metrics.clone())),
        };

        components.rf.open().await;
        if config.motor.auto_connect {
            if let Err(err) = components.motor.auto_connect().await {
                warn!(error = %err, "motor auto-connect failed; reconnect loop will retry");
            }
        }

        let registry = Arc::new(SessionRegistry::new(
            config.server.session_queue_depth,
            metrics.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            components.motor.clone(),
            components.eeprom.clone(),
            components.rf.clone(),
            components.gpio.clone(),
            &config.eeprom,
            metrics,
        ));
        let server = match WebSocketServerBuilder::new(
            config.server.listen,
            registry.clone(),
            dispatcher,
        )
        .spawn()
        .await
        {
            Ok(server) => server,
            Err(err) => {
                components.release().await;
                return Err(HubError::Server {
                    addr: config.server.listen,
                    reason: format!("{err:#}"),
                });
            }
        };

        let status = StatusBroadcaster::new(
            registry.clone(),
            components.motor.clone(),
            components.rf.clone(),
            components.gpio.clone(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let status_task = tokio::spawn(status.clone().run(config.status.tick, shutdown_rx));

        info!(
            address = %server.local_addr(),
            tick_ms = config.status.tick.as_millis() as u64,
            "hub running"
        );
        Ok(HubHandle {
            mode: config.mode,
            server,
            registry,
            status,
            status_task,
            shutdown: shutdown_tx,
            components,
        })
    }
}

impl std::fmt::Debug for MtrHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtrHub")
            .field("mode", &self.config.mode)
            .field("links", &self.links)
            .finish()
    }
}

struct Components {
    motor: Arc<MotorSupervisor>,
    eeprom: Arc<EepromStore>,
    rf: Arc<RfLink>,
    gpio: Arc<GpioBridge>,
}

impl Components {
    async fn release(&self) {
        self.gpio.drive_outputs_low();
        self.motor.shutdown().await;
        self.rf.close().await;
    }
}

/// Running hub.
pub struct HubHandle {
    mode: Mode,
    server: WebSocketServerHandle,
    registry: Arc<SessionRegistry>,
    status: StatusBroadcaster,
    status_task: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
    components: Components,
}

impl HubHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn motor(&self) -> Arc<MotorSupervisor> {
        self.components.motor.clone()
    }

    pub fn eeprom(&self) -> Arc<EepromStore> {
        self.components.eeprom.clone()
    }

    /// Snapshot as the next `status` message would carry it.
    pub fn status(&self) -> StatusData {
        self.status.snapshot()
    }

    /// Stop the loop and the server, detach every session, then release the
    /// links: outputs low, motor disconnected, RF port closed.
    pub async fn shutdown(self) -> Result<(), HubError> {
        let _ = self.shutdown.send(());
        let loop_result = self.status_task.await;
        if let Err(err) = &loop_result {
            error!(error = %err, "status loop join error");
        }
        self.registry.close_all();
        let server_result = self.server.shutdown().await;
        self.components.release().await;
        info!("hub shutdown complete");

        loop_result.map_err(|err| HubError::Task(err.to_string()))?;
        server_result.map_err(|err| HubError::Task(format!("{err:#}")))
    }
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("mode", &self.mode)
            .field("address", &self.local_addr())
            .field("sessions", &self.registry.len())
            .finish()
    }
}
