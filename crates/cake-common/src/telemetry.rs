//! Tracing initialization
//!
//! Console output goes to stdout (plain or JSON). When a log file is
//! configured a second, plain-text layer writes there too; that file is what
//! the progress surface serves under `/log`.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,cake=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Log file could not be opened
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        /// Path that was being opened
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Emit JSON on the console instead of human-readable lines
    pub json: bool,
    /// Also append log lines to this file
    pub log_file: Option<PathBuf>,
    /// Truncate the log file before writing
    pub truncate_log_file: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            log_file: None,
            truncate_log_file: true,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(!config.truncate_log_file)
                .truncate(config.truncate_log_file)
                .open(path)
                .map_err(|source| TelemetryError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // Option<Layer> implements Layer, so both console variants compose directly
    let (json_layer, text_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(false)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_logs_to_console_only() {
        let config = TelemetryConfig::default();
        assert!(!config.json);
        assert!(config.log_file.is_none());
        assert!(config.default_filter.contains("cake=debug"));
    }

    #[test]
    fn unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = TelemetryConfig {
            // A directory cannot be opened for writing
            log_file: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        match init_telemetry(config) {
            Err(TelemetryError::LogFile { path, .. }) => {
                assert_eq!(path, dir.path().display().to_string())
            }
            other => panic!("expected log file error, got {other:?}"),
        }
    }
}
