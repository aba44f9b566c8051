//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
//! Core shared primitives for the MTR hub workspace.
//! This crate exposes configuration loading, logging, the error taxonomy, and
//! version metadata consumed across the workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, EepromConfig, GpioConfig, LedConfig, LoggingConfig, MetricsConfig, Mode,
    MotorConfig, RfConfig, SensorPinConfig, SensorRole, ServerConfig, StatusConfig,
};
pub use error::{Classify, ErrorKind};
pub use logging::{init_tracing, LogFormat};
pub use version::VersionInfo;
