//! Tracing setup for binaries and scripts using the driver.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application. [`init`] installs a `fmt` subscriber filtered by
//! `RUST_LOG`, falling back to the given level when `RUST_LOG` is unset.
//!
//! # Example
//! ```no_run
//! use gefran_pid::logging::{self, LogFormat};
//! use tracing::Level;
//!
//! logging::init(Level::DEBUG, LogFormat::Compact).unwrap();
//! tracing::info!("controller script started");
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format of the console subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line output with colors, for interactive use
    Pretty,
    /// One line per event, for long-running logging sessions
    #[default]
    Compact,
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, host
/// applications) this returns `Ok(())`.
pub fn init(level: Level, format: LogFormat) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_for(level)));

    let layer = match format {
        LogFormat::Pretty => fmt::layer().pretty().with_filter(env_filter).boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("already") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {e}"))
            }
        })
}

/// Parse a level name such as `"info"` or `"DEBUG"`.
pub fn parse_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(format!(
            "Invalid log level '{other}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn filter_for(level: Level) -> String {
    format!("gefran_pid={},tokio_modbus=warn", level.as_str().to_lowercase())
}
