use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::config::DiagnosticsConfig;

pub const DEFAULT_FILTER: &str =
    "info,scoreline_core=trace,scoreline_cli=trace,scoreline::engine=debug";
pub const DEFAULT_FILE_PREFIX: &str = "scoreline";
/// Takes precedence over `RUST_LOG` and the configured filter.
pub const FILTER_ENV: &str = "SCORELINE_LOG";
/// Target carrying lines printed by the synthesis engine.
pub const ENGINE_TARGET: &str = "scoreline::engine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub filter: String,
    /// Mirror events to stdout next to the JSON log file.
    pub console: bool,
}

impl TracingOptions {
    #[must_use]
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            filter: DEFAULT_FILTER.to_string(),
            console: true,
        }
    }

    #[must_use]
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            log_dir: config.log_dir.clone(),
            file_prefix: config.trace_file_prefix.clone(),
            filter: config.rust_log_filter.clone(),
            console: config.console,
        }
    }

    fn log_file_name(&self, at: DateTime<Utc>) -> String {
        format!("{}-{}.log", self.file_prefix, at.format("%Y%m%d-%H%M%S"))
    }
}

/// Keeps the JSON writer flushing until dropped.
pub struct TelemetryGuard {
    pub run_id: Uuid,
    pub log_file: PathBuf,
    _file_guard: WorkerGuard,
}

pub fn init_tracing(log_dir: impl AsRef<Path>) -> anyhow::Result<TelemetryGuard> {
    install_tracing(&TracingOptions::new(log_dir.as_ref()))
}

pub fn init_tracing_from_config(config: &DiagnosticsConfig) -> anyhow::Result<TelemetryGuard> {
    install_tracing(&TracingOptions::from_config(config))
}

pub fn install_tracing(options: &TracingOptions) -> anyhow::Result<TelemetryGuard> {
    let log_dir = options.log_dir.as_path();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let run_id = Uuid::new_v4();
    let file_name = options.log_file_name(Utc::now());
    let log_file = log_dir.join(&file_name);
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = options.console.then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_thread_ids(true)
            .with_target(true)
    });

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer);

    if let Err(error) = tracing_subscriber::registry()
        .with(env_filter(&options.filter))
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        warn!(?error, "global tracing subscriber already initialized");
    } else {
        info!(%run_id, log_file = %log_file.display(), "tracing initialized");
    }

    Ok(TelemetryGuard {
        run_id,
        log_file,
        _file_guard: file_guard,
    })
}

fn env_filter(configured: &str) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(configured))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn log_files_are_named_after_prefix_and_start_time() {
        let options = TracingOptions {
            file_prefix: "render-farm".to_string(),
            ..TracingOptions::new("logs")
        };
        let at = Utc
            .with_ymd_and_hms(2026, 3, 9, 14, 5, 7)
            .single()
            .expect("timestamp is unambiguous");
        assert_eq!(options.log_file_name(at), "render-farm-20260309-140507.log");
    }

    #[test]
    fn options_follow_the_diagnostics_section() {
        let config = DiagnosticsConfig {
            rust_log_filter: "warn".to_string(),
            trace_file_prefix: "nightly".to_string(),
            log_dir: PathBuf::from("/var/log/scoreline"),
            console: false,
        };
        let options = TracingOptions::from_config(&config);
        assert_eq!(options.log_dir, PathBuf::from("/var/log/scoreline"));
        assert_eq!(options.file_prefix, "nightly");
        assert_eq!(options.filter, "warn");
        assert!(!options.console);
    }
}
