use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::ValueEnum;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config.level.to_filter()))
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

const NOISY_DEPENDENCIES: &[&str] = &["rumqttc", "rustls", "mio"];

fn build_env_filter(level: LevelFilter) -> EnvFilter {
    if let Ok(filter) = std::env::var("HUB_REMOTE_LOG_FILTER") {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level, allow_dependency_traces()))
}

fn default_filter_for(level: LevelFilter, dependency_traces: bool) -> String {
    let mut filter = match level {
        LevelFilter::TRACE => "info,hub_remote=trace".to_string(),
        LevelFilter::DEBUG => "info,hub_remote=debug".to_string(),
        other => other.to_string().to_lowercase(),
    };
    if !dependency_traces && level > LevelFilter::WARN {
        for target in NOISY_DEPENDENCIES {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=warn");
        }
    }
    filter
}

fn allow_dependency_traces() -> bool {
    std::env::var("HUB_REMOTE_TRACE_DEPS").is_ok_and(|v| v != "0" && !v.is_empty())
}

/// Serve Prometheus metrics when an address is configured. Without one the
/// metric macros stay no-ops.
pub fn install_metrics(listen: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = listen else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(target: "hub_remote::bridge", %addr, "serving metrics");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dependencies_are_clamped_unless_requested() {
        assert_eq!(
            default_filter_for(LevelFilter::DEBUG, false),
            "info,hub_remote=debug,rumqttc=warn,rustls=warn,mio=warn"
        );
        assert_eq!(default_filter_for(LevelFilter::TRACE, true), "info,hub_remote=trace");
        assert_eq!(default_filter_for(LevelFilter::WARN, false), "warn");
    }
}
