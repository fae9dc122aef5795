//! Logging setup for the CLI

use grainidx_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging from config.
///
/// Logs to the configured file when one is set (no ANSI), otherwise to the
/// console. `RUST_LOG` overrides the configured level.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
  let level = if verbose {
    tracing::Level::DEBUG
  } else {
    parse_log_level(&config.log_level)
  };
  let env_filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  let file = config
    .log_file
    .as_ref()
    .and_then(|path| Some((path.parent()?.to_path_buf(), path.file_name()?.to_os_string())));

  if let Some((dir, name)) = file
    && std::fs::create_dir_all(&dir).is_ok()
  {
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_ansi(false)
      .with_writer(writer)
      .init();
    return Some(guard);
  }

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(true)
    .init();
  None
}
