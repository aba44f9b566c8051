//! ---
//! mtr_section: "03-observability"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Metrics collection and export utilities."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the hub.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .context("failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .context("failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address, with the real port when `0` was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "mtr_hubd_starts_total",
            "Total number of times the hub daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "mtr_hubd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new("mtr_hubd_build_info", "Build metadata for the running daemon"),
            &["version", "target", "profile", "mode"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, target: &str, profile: &str, mode: &str) {
        self.build_info
            .with_label_values(&[version, target, profile, mode])
            .set(1.0);
    }
}

/// Counters and gauges for the coordination hub.
#[derive(Clone)]
pub struct HubMetrics {
    sessions_active: IntGauge,
    sessions_opened: IntCounter,
    sessions_dropped: IntCounter,
    broadcasts: IntCounter,
    commands: IntCounterVec,
    gpio_events: IntCounterVec,
    gpio_events_dropped: IntCounter,
    motor_connected: IntGauge,
    motor_reconnect_attempts: IntCounter,
    motor_reconnect_exhausted: IntCounter,
    eeprom_retries: IntCounter,
    eeprom_failures: IntCounterVec,
    rf_frames: IntCounterVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl HubMetrics {
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        Ok(Self {
            sessions_active: gauge(registry, "mtr_hub_sessions_active", "Client sessions currently attached")?,
            sessions_opened: counter(registry, "mtr_hub_sessions_opened_total", "Client sessions accepted")?,
            sessions_dropped: counter(
                registry,
                "mtr_hub_sessions_dropped_total",
                "Sessions removed because a broadcast could not be delivered",
            )?,
            broadcasts: counter(registry, "mtr_hub_broadcasts_total", "Messages fanned out to all sessions")?,
            commands: counter_vec(
                registry,
                "mtr_hub_commands_total",
                "Client commands handled by name and outcome",
                &["cmd", "outcome"],
            )?,
            gpio_events: counter_vec(registry, "mtr_hub_gpio_events_total", "Edges drained from the GPIO queue", &["pin"])?,
            gpio_events_dropped: counter(
                registry,
                "mtr_hub_gpio_events_dropped_total",
                "Edges discarded because the GPIO queue was full",
            )?,
            motor_connected: gauge(registry, "mtr_hub_motor_connected", "1 while the motor link is up")?,
            motor_reconnect_attempts: counter(
                registry,
                "mtr_hub_motor_reconnect_attempts_total",
                "Connect calls made by the reconnection sequence",
            )?,
            motor_reconnect_exhausted: counter(
                registry,
                "mtr_hub_motor_reconnect_exhausted_total",
                "Reconnection sequences that used every attempt without success",
            )?,
            eeprom_retries: counter(registry, "mtr_hub_eeprom_retries_total", "EEPROM attempts that were retried")?,
            eeprom_failures: counter_vec(
                registry,
                "mtr_hub_eeprom_failures_total",
                "EEPROM operations that failed by operation",
                &["op"],
            )?,
            rf_frames: counter_vec(registry, "mtr_hub_rf_frames_total", "Frames written to the RF module", &["command"])?,
        })
    }

    /// Metrics bound to a private registry nobody scrapes.
    pub fn detached() -> Result<Self> {
        Self::new(&new_registry())
    }

    pub fn session_opened(&self) {
        self.sessions_opened.inc();
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn session_dropped(&self) {
        self.sessions_dropped.inc();
    }

    pub fn broadcast_sent(&self) {
        self.broadcasts.inc();
    }

    pub fn command_handled(&self, cmd: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.commands.with_label_values(&[cmd, outcome]).inc();
    }

    pub fn gpio_event(&self, pin: u8) {
        self.gpio_events.with_label_values(&[&pin.to_string()]).inc();
    }

    pub fn gpio_event_dropped(&self) {
        self.gpio_events_dropped.inc();
    }

    pub fn set_motor_connected(&self, connected: bool) {
        self.motor_connected.set(i64::from(connected));
    }

    pub fn motor_reconnect_attempt(&self) {
        self.motor_reconnect_attempts.inc();
    }

    pub fn motor_reconnect_exhausted(&self) {
        self.motor_reconnect_exhausted.inc();
    }

    pub fn eeprom_retried(&self, retries: usize) {
        self.eeprom_retries.inc_by(retries as u64);
    }

    pub fn eeprom_failed(&self, op: &str) {
        self.eeprom_failures.with_label_values(&[op]).inc();
    }

    pub fn rf_frame(&self, command: u8) {
        self.rf_frames
            .with_label_values(&[&format!("0x{command:02X}")])
            .inc();
    }
}

impl std::fmt::Debug for HubMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;
