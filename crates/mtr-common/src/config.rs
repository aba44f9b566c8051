//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:8765".parse().expect("valid default listen address")
}

fn default_session_queue_depth() -> usize {
    64
}

fn default_tick() -> Duration {
    Duration::from_millis(50)
}

fn default_motor_port() -> String {
    "auto".to_owned()
}

fn default_baudrate() -> u32 {
    19_200
}

fn default_parity() -> String {
    "none".to_owned()
}

fn default_databits() -> u8 {
    8
}

fn default_stopbits() -> u8 {
    1
}

fn default_attempts() -> usize {
    3
}

fn default_reconnect_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_rf_port() -> String {
    "/dev/usb-rf".to_owned()
}

fn default_response_window() -> Duration {
    Duration::from_millis(50)
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_eeprom_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_write_cycle() -> Duration {
    Duration::from_millis(10)
}

fn default_mtr_version() -> String {
    "2.0".to_owned()
}

fn default_country() -> String {
    "CLASSYS".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the hub runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub motor: MotorConfig,
    #[serde(default)]
    pub rf: RfConfig,
    #[serde(default)]
    pub eeprom: EepromConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "MTR_HUB_CONFIG";

    /// Load configuration from disk, respecting the `MTR_HUB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.server.session_queue_depth == 0 {
            return Err(anyhow!("server.session_queue_depth must be at least 1"));
        }
        if self.status.tick.is_zero() {
            return Err(anyhow!("status.tick_ms must be greater than zero"));
        }
        if self.motor.reconnect_attempts == 0 {
            return Err(anyhow!("motor.reconnect_attempts must be at least 1"));
        }
        self.eeprom.validate()?;
        self.gpio.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            server: ServerConfig::default(),
            status: StatusConfig::default(),
            motor: MotorConfig::default(),
            rf: RfConfig::default(),
            eeprom: EepromConfig::default(),
            gpio: GpioConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Where the hub gets its physical links from.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Links come from the hardware providers registered by the integrator.
    #[default]
    Production,
    /// Every link is backed by an in-memory simulator.
    Simulation,
}

impl Mode {
    pub fn is_simulation(&self) -> bool {
        matches!(self, Mode::Simulation)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "simulation" => Ok(Mode::Simulation),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Outbound broadcast messages buffered per session before it is dropped.
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            session_queue_depth: default_session_queue_depth(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(rename = "tick_ms", default = "default_tick")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
        }
    }
}

/// Motor link parameters. The serial fields double as the reconnect target.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_motor_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_databits")]
    pub databits: u8,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    #[serde(default = "default_attempts")]
    pub reconnect_attempts: usize,
    #[serde(rename = "reconnect_settle_ms", default = "default_reconnect_settle")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_settle: Duration,
    /// Random delay, up to this bound, added between reconnect attempts.
    #[serde(rename = "reconnect_jitter_ms", default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_jitter: Duration,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            port: default_motor_port(),
            baudrate: default_baudrate(),
            parity: default_parity(),
            databits: default_databits(),
            stopbits: default_stopbits(),
            reconnect_attempts: default_attempts(),
            reconnect_settle: default_reconnect_settle(),
            reconnect_jitter: Duration::ZERO,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rf_port")]
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(rename = "response_window_ms", default = "default_response_window")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_window: Duration,
    #[serde(default = "default_true")]
    pub send_setup_frame: bool,
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_rf_port(),
            baudrate: default_baudrate(),
            response_window: default_response_window(),
            send_setup_frame: true,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EepromConfig {
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde(rename = "retry_backoff_ms", default = "default_eeprom_backoff")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_backoff: Duration,
    #[serde(rename = "retry_jitter_ms", default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_jitter: Duration,
    #[serde(rename = "write_cycle_ms", default = "default_write_cycle")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub write_cycle: Duration,
    /// Layout used by `shot_increment` when the request names none.
    #[serde(default = "default_mtr_version")]
    pub default_mtr_version: String,
    #[serde(default = "default_country")]
    pub default_country: String,
}

impl Default for EepromConfig {
    fn default() -> Self {
        Self {
            i2c_bus: default_i2c_bus(),
            attempts: default_attempts(),
            retry_backoff: default_eeprom_backoff(),
            retry_jitter: Duration::ZERO,
            write_cycle: default_write_cycle(),
            default_mtr_version: default_mtr_version(),
            default_country: default_country(),
        }
    }
}

impl EepromConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(anyhow!("eeprom.attempts must be at least 1"));
        }
        if !matches!(self.default_mtr_version.as_str(), "2.0" | "4.0") {
            return Err(anyhow!(
                "eeprom.default_mtr_version must be \"2.0\" or \"4.0\", got {:?}",
                self.default_mtr_version
            ));
        }
        Ok(())
    }
}

/// Logical role of an edge-triggered sensor input.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    NeedleTip,
    FootSwitch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SensorPinConfig {
    pub pin: u8,
    /// When set, the sensor counts as active while the line reads LOW.
    #[serde(default)]
    pub active_low: bool,
}

/// An LED that mirrors the active state of one sensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedConfig {
    pub pin: u8,
    pub follows: SensorRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "GpioConfig::default_needle_tip")]
    pub needle_tip: SensorPinConfig,
    #[serde(default = "GpioConfig::default_foot_switch")]
    pub foot_switch: SensorPinConfig,
    #[serde(default = "GpioConfig::default_rf_fire_pin")]
    pub rf_fire_pin: Option<u8>,
    #[serde(default)]
    pub leds: Vec<LedConfig>,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl GpioConfig {
    fn default_needle_tip() -> SensorPinConfig {
        SensorPinConfig {
            pin: 17,
            active_low: false,
        }
    }

    fn default_foot_switch() -> SensorPinConfig {
        SensorPinConfig {
            pin: 18,
            active_low: true,
        }
    }

    const fn default_rf_fire_pin() -> Option<u8> {
        Some(0)
    }

    pub fn sensor(&self, role: SensorRole) -> SensorPinConfig {
        match role {
            SensorRole::NeedleTip => self.needle_tip,
            SensorRole::FootSwitch => self.foot_switch,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_queue_capacity == 0 {
            return Err(anyhow!("gpio.event_queue_capacity must be at least 1"));
        }
        let mut seen = HashSet::new();
        let pins = [self.needle_tip.pin, self.foot_switch.pin]
            .into_iter()
            .chain(self.rf_fire_pin)
            .chain(self.leds.iter().map(|led| led.pin));
        for pin in pins {
            if !seen.insert(pin) {
                return Err(anyhow!("gpio pin {} is assigned more than once", pin));
            }
        }
        Ok(())
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            needle_tip: Self::default_needle_tip(),
            foot_switch: Self::default_foot_switch(),
            rf_fire_pin: Self::default_rf_fire_pin(),
            leds: Vec::new(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.server.listen, default_listen());
        assert_eq!(config.status.tick, Duration::from_millis(50));
        assert_eq!(config.motor.reconnect_attempts, 3);
        assert_eq!(config.motor.reconnect_settle, Duration::from_secs(1));
        assert_eq!(config.eeprom.write_cycle, Duration::from_millis(10));
        assert_eq!(config.gpio.needle_tip.pin, 17);
        assert!(config.gpio.foot_switch.active_low);
    }

    #[test]
    fn durations_parse_as_milliseconds() {
        let config: AppConfig = r#"
            mode = "simulation"

            [status]
            tick_ms = 20

            [motor]
            reconnect_settle_ms = 5

            [[gpio.leds]]
            pin = 24
            follows = "needle_tip"
        "#
        .parse()
        .unwrap();
        assert!(config.mode.is_simulation());
        assert_eq!(config.status.tick, Duration::from_millis(20));
        assert_eq!(config.motor.reconnect_settle, Duration::from_millis(5));
        assert_eq!(
            config.gpio.leds,
            vec![LedConfig {
                pin: 24,
                follows: SensorRole::NeedleTip
            }]
        );
    }

    #[test]
    fn duplicate_pins_are_rejected() {
        let err = r#"
            [gpio]
            rf_fire_pin = 17
        "#
        .parse::<AppConfig>()
        .unwrap_err();
        assert!(err.to_string().contains("pin 17"));
    }

    #[test]
    fn zero_tick_is_rejected() {
        let err = "[status]\ntick_ms = 0\n".parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("tick_ms"));
    }

    #[test]
    fn unknown_default_layout_is_rejected() {
        let err = "[eeprom]\ndefault_mtr_version = \"3.0\"\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("default_mtr_version"));
    }

    #[test]
    fn load_with_source_reports_inspected_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = AppConfig::load_with_source(&[missing.clone()]).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));

        let present = dir.path().join("hub.toml");
        fs::write(&present, "mode = \"simulation\"\n").unwrap();
        let loaded = AppConfig::load_with_source(&[missing, present.clone()]).unwrap();
        assert_eq!(loaded.source, present);
        assert!(loaded.config.mode.is_simulation());
    }
}
