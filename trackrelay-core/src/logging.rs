//! Logging for trackrelay
//!
//! The file log lives in `$XDG_STATE_HOME/trackrelay/` and rotates daily
//! (`trackrelay.log.YYYY-MM-DD`). One-shot commands can echo the same events
//! to stderr so queueing and resend failures show up next to their output.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// File name prefix of the rolling log
pub const LOG_FILE_PREFIX: &str = "trackrelay.log";

/// Where log events go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Rolling file only (the relay loop, which owns stdout/stderr)
    File,
    /// Rolling file plus a compact stderr echo
    FileAndStderr,
}

/// Initialize the logging system
///
/// The level comes from `config.level`; `RUST_LOG` overrides it when set.
/// Fails on an unknown level or if a global subscriber is already installed.
pub fn init(config: &LoggingConfig, output: LogOutput) -> Result<LoggingGuard> {
    let level = parse_level(&config.level)?;
    let log_dir = Config::state_dir();

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);

    // Non-blocking so a slow disk never stalls a delivery
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let stderr_layer = (output == LogOutput::FileAndStderr).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install logger: {}", e)))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %level,
        ?output,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Parse `logging.level` (off, error, warn, info, debug, trace; any case)
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level.trim().parse::<LevelFilter>().map_err(|_| {
        Error::Config(format!(
            "logging.level must be one of off, error, warn, info, debug, trace; got {:?}",
            level
        ))
    })
}

/// Keeps the background log writer alive; flushes pending lines on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
