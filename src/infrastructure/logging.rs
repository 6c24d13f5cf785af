//! Tracing setup for the stack.
//!
//! Every layer logs under its own target: `hci`, `l2cap`, `bltools` (driver
//! registry and discovery), `wiimote` and `settings`. Per-target levels come
//! from [`LogSettings::target_levels`]; `RUST_LOG` replaces the whole filter.

use crate::domain::settings::LogSettings;
use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Targets the stack logs under.
pub const TARGETS: [&str; 5] = ["hci", "l2cap", "bltools", "wiimote", "settings"];

const LOG_SUFFIX: &str = "log";

/// Keeps the file writer alive; logs are flushed when this is dropped.
pub struct LoggingGuard {
    _writer: Option<WorkerGuard>,
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `level` followed by one `target=level` directive per override.
fn directives(settings: &LogSettings) -> String {
    settings
        .target_levels
        .iter()
        .fold(settings.level.clone(), |mut acc, (target, level)| {
            acc.push_str(&format!(",{}={}", target, level));
            acc
        })
}

fn filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(settings)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `<log_dir>/<prefix>.<date>.log`, rotated as configured.
fn file_writer(settings: &LogSettings) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let appender = RollingFileAppender::builder()
        .rotation(rotation(&settings.rotation))
        .filename_prefix(&settings.file_name_prefix)
        .filename_suffix(LOG_SUFFIX)
        .build(&settings.log_dir)
        .with_context(|| format!("opening log directory {}", settings.log_dir))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber.
///
/// Fails if the log directory cannot be used or a subscriber is already
/// installed.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stdout)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let (file_layer, writer) = if settings.file_logging_enabled {
        let (non_blocking, guard) = file_writer(settings)?;
        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(
        target: "settings",
        "Logging with \"{}\"{}",
        directives(settings),
        if settings.file_logging_enabled { ", to file" } else { "" }
    );
    for target in settings.target_levels.keys() {
        if !TARGETS.contains(&target.as_str()) {
            tracing::warn!(target: "settings", "Level set for unknown log target {}", target);
        }
    }

    Ok(LoggingGuard { _writer: writer })
}
