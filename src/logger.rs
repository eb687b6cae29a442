use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target of the JSON session lifecycle report.
pub const SESSION_TARGET: &str = "session";

/// Keeps the background log writers alive. Dropping it flushes and stops them.
pub struct LogGuards {
    _text: WorkerGuard,
    _events: WorkerGuard,
}

/// Installs the global subscriber:
///
/// - stdout and a daily-rolling text log, both filtered by `log_level`
///   (an `EnvFilter` directive such as `"info"` or `"cloudtitan=debug"`);
/// - a daily-rolling newline-delimited JSON log that receives every event
///   with target `session`, whatever the level filter says.
pub fn init_tracing(
    log_dir: PathBuf,
    log_file: &str,
    event_file: &str,
    log_level: &str,
) -> Result<LogGuards> {
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let (text_writer, text_guard) = tracing_appender::non_blocking(appender(&log_dir, log_file));
    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_ansi(false)
        .with_filter(level_filter(log_level)?);

    let (event_writer, event_guard) = tracing_appender::non_blocking(appender(&log_dir, event_file));
    let event_layer = fmt::layer()
        .json()
        .with_writer(event_writer)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{SESSION_TARGET}=info")));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(level_filter(log_level)?);

    Registry::default()
        .with(stdout_layer)
        .with(text_layer)
        .with(event_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(LogGuards {
        _text: text_guard,
        _events: event_guard,
    })
}

/// `RUST_LOG` wins over the configured level.
fn level_filter(log_level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level `{log_level}`"))
}

fn appender(dir: &Path, file: &str) -> RollingFileAppender {
    RollingFileAppender::new(Rotation::DAILY, dir, file)
}
