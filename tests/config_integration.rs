//! ---
//! mtr_section: "15-testing-qa-runbook"
//! mtr_subsection: "integration-tests"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Integration and validation tests for the MTR hub stack."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mtr_common::{AppConfig, Mode, SensorRole};

fn workspace_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

fn read(path: &str) -> String {
    let full = workspace_path(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn shipped_configs_carry_frontmatter() {
    for config in ["configs/hub.toml", "configs/hub.dev.toml"] {
        let content = read(config);
        assert!(
            content.starts_with("# ---"),
            "{config} must include frontmatter header"
        );
    }
}

#[test]
fn production_config_matches_device_defaults() {
    let config: AppConfig = read("configs/hub.toml").parse().unwrap();
    assert_eq!(config.mode, Mode::Production);
    assert_eq!(config.server.listen.port(), 8765);
    assert_eq!(config.status.tick, Duration::from_millis(50));
    assert_eq!(config.motor.port, "auto");
    assert_eq!(config.motor.baudrate, 19_200);
    assert_eq!(config.motor.reconnect_attempts, 3);
    assert_eq!(config.motor.reconnect_settle, Duration::from_secs(1));
    assert_eq!(config.motor.reconnect_jitter, Duration::from_millis(200));
    assert_eq!(config.eeprom.retry_jitter, Duration::from_millis(20));
    assert_eq!(config.eeprom.attempts, 3);
    assert_eq!(config.gpio.sensor(SensorRole::NeedleTip).pin, 17);
    assert!(config.gpio.sensor(SensorRole::FootSwitch).active_low);
    assert_eq!(config.gpio.rf_fire_pin, Some(0));
    assert!(config.metrics.enabled);
}

#[test]
fn dev_config_runs_on_simulated_links() {
    let config: AppConfig = read("configs/hub.dev.toml").parse().unwrap();
    assert!(config.mode.is_simulation());
    assert!(config.server.listen.ip().is_loopback());
    assert_eq!(config.gpio.leds.len(), 1);
    assert!(!config.metrics.enabled);
}

#[test]
fn loader_prefers_the_first_existing_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let custom = dir.path().join("custom.toml");
    fs::write(&custom, "mode = \"simulation\"\n[status]\ntick_ms = 25\n").unwrap();

    let loaded = AppConfig::load_with_source(&[
        dir.path().join("missing.toml"),
        custom.clone(),
        workspace_path("configs/hub.toml"),
    ])
    .unwrap();
    assert_eq!(loaded.source, custom);
    assert_eq!(loaded.config.status.tick, Duration::from_millis(25));
}

#[test]
fn conflicting_pins_are_rejected() {
    let content = read("configs/hub.toml").replace("pin = 27", "pin = 17");
    let err = content.parse::<AppConfig>().unwrap_err();
    assert!(err.to_string().contains("more than once"), "{err:#}");
}
