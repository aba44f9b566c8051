//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "binary"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Binary entrypoint for the MTR hub daemon."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use mtr_common::config::{AppConfig, Mode};
use mtr_common::logging::init_tracing;
use mtr_common::version::VersionInfo;
use mtr_core::MtrHub;
use mtr_links::sim::SimulatedLinks;
use mtr_links::{Level, LinkSet};
use mtr_metrics::{new_registry, spawn_http_server, DaemonMetrics, HubMetrics};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = concat!("mtr-hubd ", env!("CARGO_PKG_VERSION")),
    about = "MTR device coordination hub",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", env = "MTR_HUB_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[arg(long, value_name = "ADDR", help = "Override the WebSocket listen address")]
    listen: Option<SocketAddr>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    Simulation,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::Simulation => Mode::Simulation,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/hub.toml"));
    candidates.push(PathBuf::from("configs/hub.dev.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();

    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    init_tracing("mtr-hubd", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        version = %version.cli_string(),
        "configuration loaded"
    );

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(&registry)?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let mode_label = format!("{:?}", config.mode).to_lowercase();
    daemon_metrics.set_build_info(&version.semver, &version.target, &version.profile, &mode_label);
    let hub_metrics = HubMetrics::new(&registry)?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen)
            .context("failed to start metrics exporter")?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let links = links_for(&config);
    let handle = MtrHub::new(config, links, Some(hub_metrics)).start().await?;

    info!(mode = ?handle.mode(), address = %handle.local_addr(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Links for the configured mode.
///
/// Hardware providers are registered by the integrator; a stock build has
/// none, so production mode starts with every link unavailable and the
/// affected commands report it.
fn links_for(config: &AppConfig) -> LinkSet {
    match config.mode {
        Mode::Simulation => {
            let links = SimulatedLinks::new();
            for role in [
                mtr_common::SensorRole::NeedleTip,
                mtr_common::SensorRole::FootSwitch,
            ] {
                let sensor = config.gpio.sensor(role);
                if sensor.active_low {
                    links.gpio.input_pin(sensor.pin).drive(Level::High);
                }
            }
            info!("simulated links attached");
            links.link_set()
        }
        Mode::Production => {
            warn!("no hardware link providers registered; running with links unavailable");
            LinkSet::unavailable()
        }
    }
}
