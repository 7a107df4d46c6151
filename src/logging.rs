//! Log setup: a daily rolling file plus warnings on stderr.
//!
//! Filtering comes from `OPSDECK_LOG` (EnvFilter syntax), defaulting to
//! `info`. stdout is left for command output.

use color_eyre::{eyre::eyre, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_ENV: &str = "OPSDECK_LOG";
const LOG_FILE_PREFIX: &str = "opsdeck.log";

/// Keeps the file writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
  _file_guard: WorkerGuard,
}

/// Install the global subscriber. `verbose` echoes everything down to
/// debug on stderr instead of only warnings.
pub fn init(log_dir: &Path, verbose: bool) -> Result<LoggingGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(file_writer)
    .with_ansi(false)
    .with_target(true);

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_writer(io::stderr)
    .with_target(false)
    .compact()
    .with_filter(if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN });

  tracing_subscriber::registry()
    .with(env_filter(std::env::var(LOG_ENV).ok().as_deref(), verbose))
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}

fn env_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
  let fallback = if verbose { "debug" } else { "info" };
  match directives {
    Some(d) if !d.trim().is_empty() => {
      EnvFilter::try_new(d).unwrap_or_else(|_| EnvFilter::new(fallback))
    }
    _ => EnvFilter::new(fallback),
  }
}

/// `<data dir>/opsdeck/logs`
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("opsdeck").join("logs"))
}
