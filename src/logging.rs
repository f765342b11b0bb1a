//! Tracing setup: stderr plus an optional daily-rotated log file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Keeps the file writer alive; hold it for the life of the program.
pub struct LogGuard {
  _guard: Option<WorkerGuard>,
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<LogGuard> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log filter {}: {}", config.level, e))?;

  let (file_layer, guard) = if config.file {
    std::fs::create_dir_all(log_dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(log_dir, "offsync.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer().with_ansi(false).with_writer(writer);
    (Some(layer), Some(guard))
  } else {
    (None, None)
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(LogGuard { _guard: guard })
}
