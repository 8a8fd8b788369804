//! # Logging
//!
//! Installs the global `tracing` subscriber.
//!
//! Output always goes to stdout. When `[logging] dir` is set, a second,
//! uncolored copy is written to a daily-rolling file in that directory.
//! `RUST_LOG` overrides the configured level.

use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Result, StumblerError};

/// Prefix of the rolling log files (`stumbler.log.YYYY-MM-DD`)
pub const LOG_FILE_PREFIX: &str = "stumbler.log";

/// Install the global subscriber
///
/// # Returns
///
/// The file writer's guard when file logging is enabled. Keep it alive for
/// the life of the process; dropping it flushes and stops the file writer.
///
/// # Errors
///
/// Returns error if:
/// - The log directory cannot be created
/// - A global subscriber is already installed
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| StumblerError::Logging(e.to_string()))?;

    Ok(guard)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
