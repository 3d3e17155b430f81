use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to a daily log file in `log_dir`.
///
/// `RUST_LOG` takes precedence over `level`. The returned guard flushes
/// buffered lines when dropped, so keep it alive until exit.
pub fn init(level: &str, log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .map_err(|e| eyre!("Invalid log level '{}': {}", level, e))?;

  let file_appender = rolling::daily(log_dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(env_filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
