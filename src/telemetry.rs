//! Tracing bootstrap for hosts embedding the flow.
//!
//! Logs go to stderr, or to a daily-rolling file when `log_dir` is set.
//! `RUST_LOG` overrides the configured level.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ConfigError;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Write to `{log_dir}/{file_prefix}.YYYY-MM-DD` instead of stderr.
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "enrollment-flow.log".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns the file writer's guard when logging to a file; keep it alive
/// until shutdown so buffered lines are flushed. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let init_err = |e: tracing_subscriber::util::TryInitError| ConfigError::InvalidValue {
        key: "tracing".into(),
        message: e.to_string(),
    };

    match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::InvalidValue {
                key: "log_dir".into(),
                message: format!("{}: {e}", dir.display()),
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .map_err(init_err)?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .map_err(init_err)?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_log_to_stderr_at_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn second_init_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TelemetryConfig {
            log_dir: Some(dir.path().join("logs")),
            ..Default::default()
        };
        // Whichever init wins, the other must fail instead of panicking.
        let first = init_tracing(&config);
        let second = init_tracing(&TelemetryConfig::default());
        assert!(first.is_err() || second.is_err());
        if first.is_ok() {
            assert!(dir.path().join("logs").is_dir());
        }
    }
}
