//! Error types for the controller driver.
//!
//! `PidError` is the only error type that crosses the public API. Transport
//! failures (`TransportError`) are converted at the session boundary so that
//! callers deal with a small, uniform set of kinds:
//!
//! - **`Connection`**: the serial link could not be opened or closed, or a
//!   register operation was attempted on a session that is not connected.
//! - **`Communication`**: a register read or write failed (timeout, I/O error,
//!   Modbus exception, malformed response).
//! - **`Configuration`**: invalid configuration values, save paths or numeric
//!   arguments.
//! - **`Storage`**: a sample log could not be written to disk.
//! - **`Busy`**: the requested activity conflicts with the one in progress
//!   (for example starting polling while a stabilization wait runs).
//! - **`DisconnectFailed`**: several failures collected while disconnecting.
//! - **`SaveFailed`**: both logs failed to save on an explicit save.

use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Convenience alias for results using the driver error type.
pub type PidResult<T> = std::result::Result<T, PidError>;

/// User-facing hint attached to failed connection attempts.
pub const CONNECT_HINT: &str =
    "Could not connect to the PID controller, make sure the right port was selected";

#[derive(Error, Debug)]
pub enum PidError {
    #[error("{message}")]
    Connection {
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error("Communication error during {operation}: {source}")]
    Communication {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to save log '{}': {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Controller is busy: {0}")]
    Busy(String),

    #[error("Disconnect failed with {} error(s)", .0.len())]
    DisconnectFailed(Vec<PidError>),

    #[error("Saving logs failed with {} error(s)", .0.len())]
    SaveFailed(Vec<PidError>),
}

impl PidError {
    /// Connection failure with no underlying transport error.
    pub fn not_connected() -> Self {
        PidError::Connection {
            message: "PID controller is not connected".to_string(),
            source: None,
        }
    }

    pub(crate) fn communication(operation: &'static str, source: TransportError) -> Self {
        PidError::Communication { operation, source }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: impl Into<csv::Error>) -> Self {
        PidError::Storage {
            path: path.into(),
            source: source.into(),
        }
    }
}

impl From<figment::Error> for PidError {
    fn from(err: figment::Error) -> Self {
        PidError::Configuration(err.to_string())
    }
}
