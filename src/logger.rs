//! Logging infrastructure for circuitwatch-rs.
//!
//! Built on the tracing ecosystem. Library modules emit structured
//! `tracing` events directly; the application layer logs through
//! [`plog`], which maps the configured [`LogLevel`] onto tracing macros.
//!
//! # Example
//!
//! ```rust,no_run
//! use circuitwatch_rs::{logger, LogLevel};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "circuitwatch started");
//! ```
//!
//! Output goes to stdout with ANSI colors by default, or appends to a file
//! when a path is given. The `RUST_LOG` environment variable overrides the
//! configured level.

use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the logging system.
///
/// Call once at application startup; subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - minimum log level to output
/// * `logfile` - `None` for stdout, or a file path to append to
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, or
/// [`Error::Config`] if the tracing subscriber is already set elsewhere.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

/// Log a message at the specified level.
///
/// Notice maps to `info!` since tracing has no notice level.
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info | LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}
