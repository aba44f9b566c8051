//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Shared primitives and utilities for the hub runtime."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "MTR_HUB_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Console output style. Production runs JSON; bench setups read `pretty`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Install the global subscriber: the configured console format plus a daily
/// JSON file under `config.directory`.
///
/// The filter comes from `MTR_HUB_LOG`, then `RUST_LOG`, then `info`.
/// Per-tick status events sit at `trace`.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory).with_context(|| {
        format!("unable to create log directory {}", config.directory.display())
    })?;
    let file_name = log_file_name(service_name, config);
    let (file_writer, guard) = tracing_appender::non_blocking(daily(&config.directory, &file_name));
    let _ = FILE_GUARD.set(guard);

    let file_layer = fmt::layer()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(file_writer);

    let installed = tracing_subscriber::registry()
        .with(filter_from_env())
        .with(console_layer(config.format))
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            service = %service_name,
            log_file = %config.directory.join(&file_name).display(),
            format = ?config.format,
            "tracing initialised"
        );
    }
    Ok(())
}

fn log_file_name(service_name: &str, config: &LoggingConfig) -> PathBuf {
    match &config.file_prefix {
        Some(prefix) => PathBuf::from(format!("{prefix}-{service_name}.log")),
        None => PathBuf::from(format!("{service_name}.log")),
    }
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = fmt::layer().with_timer(fmt::time::UtcTime::rfc_3339());
    match format {
        LogFormat::StructuredJson => layer.with_target(false).json().boxed(),
        LogFormat::Pretty => layer.with_target(true).boxed(),
    }
}

fn filter_from_env() -> EnvFilter {
    directive_filter(std::env::var(LOG_ENV).ok(), std::env::var("RUST_LOG").ok())
}

fn directive_filter(hub: Option<String>, rust: Option<String>) -> EnvFilter {
    for (source, directive) in [(LOG_ENV, hub), ("RUST_LOG", rust)] {
        let Some(directive) = directive else {
            continue;
        };
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!("ignoring invalid {source} directive {directive:?}: {err}"),
        }
    }
    EnvFilter::new(DEFAULT_DIRECTIVE)
}
