//! Logging initialization for ticketflow.
//!
//! Logs to stderr by default; when a log file is configured, logs go to
//! the file instead (no ANSI codes).

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Result of logging initialization
pub struct LoggingHandle {
    /// Guard that must be kept alive for the duration of the program.
    /// When dropped, ensures all buffered logs are flushed.
    pub _guard: Option<WorkerGuard>,

    /// Path to the log file (only set when file logging is configured)
    pub log_file_path: Option<PathBuf>,
}

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from the configured
/// level (or "debug" when `debug_override` is true). Returns a
/// `LoggingHandle` that must be kept alive for the duration of the program.
pub fn init_logging(config: &LoggingConfig, debug_override: bool) -> Result<LoggingHandle> {
    let log_level = if debug_override {
        "debug".to_string()
    } else {
        config.level.clone()
    };

    let filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or(log_level));

    if let Some(file) = &config.file {
        let log_file_path = PathBuf::from(file);
        let logs_dir = log_file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(logs_dir)?;

        let file_name = log_file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ticketflow.log".to_string());

        let file_appender = tracing_appender::rolling::never(logs_dir, &file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false) // No ANSI codes in log files
                    .with_writer(non_blocking),
            )
            .init();

        Ok(LoggingHandle {
            _guard: Some(guard),
            log_file_path: Some(log_file_path),
        })
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();

        Ok(LoggingHandle {
            _guard: None,
            log_file_path: None,
        })
    }
}
