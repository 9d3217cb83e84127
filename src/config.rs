//! Controller configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. Environment variables (prefixed with `GEFRAN_`)
//!
//! Every field has a serde default, so an empty file is a valid
//! configuration apart from the port.
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! device_id = 1
//! baud_rate = 19200
//! log_interval_secs = 5
//! save_interval_secs = 60
//! save_log = true
//! save_path = "data/gefran"
//! datetime_format = "%Y-%m-%d %H:%M:%S"
//!
//! [registers]
//! process_value = 0
//! setpoint = 55
//! decimal_point = 136
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PidError, PidResult};

/// Top-level driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidConfig {
    /// Serial port (e.g., "/dev/ttyUSB0", "COM5")
    #[serde(default)]
    pub port: String,
    /// Modbus RTU device ID of the controller
    #[serde(default = "default_device_id")]
    pub device_id: u8,
    /// Baud rate set in the controller
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-request response timeout in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Interval between temperature samples, in seconds
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,
    /// Interval between temperature log saves, in seconds
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
    /// Persist the temperature and command logs as CSV files
    #[serde(default = "default_save_log")]
    pub save_log: bool,
    /// Base path for the log files; `data/gefran` under the working directory if unset
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    /// chrono format string for timestamps
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,
    /// Register map of the controller model
    #[serde(default)]
    pub registers: RegisterMap,
}

/// Register addresses on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMap {
    /// Process value (measured temperature)
    pub process_value: u16,
    /// Working setpoint
    pub setpoint: u16,
    /// Decimal point setting shared by PV and SP
    pub decimal_point: u16,
}

impl Default for RegisterMap {
    /// Addresses used by the Gefran 650 / 1250 / 1350.
    fn default() -> Self {
        Self {
            process_value: 0,
            setpoint: 55,
            decimal_point: 136,
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_device_id() -> u8 {
    1
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_response_timeout_ms() -> u64 {
    1500
}

fn default_log_interval() -> u64 {
    5
}

fn default_save_interval() -> u64 {
    60
}

fn default_save_log() -> bool {
    true
}

fn default_datetime_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            device_id: default_device_id(),
            baud_rate: default_baud_rate(),
            response_timeout_ms: default_response_timeout_ms(),
            log_interval_secs: default_log_interval(),
            save_interval_secs: default_save_interval(),
            save_log: default_save_log(),
            save_path: None,
            datetime_format: default_datetime_format(),
            registers: RegisterMap::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl PidConfig {
    /// Defaults for the given port.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file and `GEFRAN_` environment variables.
    ///
    /// Precedence (highest to lowest): environment, file, built-in defaults.
    /// A missing file is not an error. The result is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PidResult<Self> {
        let config: Self = Self::figment(path).extract()?;

        config.validate()?;
        Ok(config)
    }

    /// The layered provider behind [`PidConfig::load_from`], for callers that
    /// merge further overrides (such as command-line flags) before extracting.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GEFRAN_"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Port is not empty
    /// - Device ID is a valid Modbus RTU unit address (1-247)
    /// - Baud rate and response timeout are non-zero
    /// - Log interval is at least one second
    /// - Save interval is not shorter than the log interval
    /// - Datetime format is a valid chrono format string
    /// - Register addresses are distinct
    pub fn validate(&self) -> PidResult<()> {
        if self.port.trim().is_empty() {
            return Err(PidError::Configuration("'port' cannot be empty".to_string()));
        }

        if !(1..=247).contains(&self.device_id) {
            return Err(PidError::Configuration(format!(
                "Invalid device_id {}. Must be 1-247",
                self.device_id
            )));
        }

        if self.baud_rate == 0 {
            return Err(PidError::Configuration("'baud_rate' must be > 0".to_string()));
        }

        if self.response_timeout_ms == 0 {
            return Err(PidError::Configuration(
                "'response_timeout_ms' must be > 0".to_string(),
            ));
        }

        if self.log_interval_secs == 0 {
            return Err(PidError::Configuration(
                "'log_interval_secs' must be at least 1".to_string(),
            ));
        }

        if self.save_interval_secs < self.log_interval_secs {
            return Err(PidError::Configuration(format!(
                "save_interval_secs ({}) must not be shorter than log_interval_secs ({})",
                self.save_interval_secs, self.log_interval_secs
            )));
        }

        validate_datetime_format(&self.datetime_format)?;

        let regs = self.registers;
        if regs.process_value == regs.setpoint
            || regs.process_value == regs.decimal_point
            || regs.setpoint == regs.decimal_point
        {
            return Err(PidError::Configuration(format!(
                "Register addresses must be distinct: {regs:?}"
            )));
        }

        Ok(())
    }

    /// Sampling interval as a `Duration`.
    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }

    /// Response timeout as a `Duration`.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Number of temperature samples between two saves: `floor(save / log)`.
    pub fn save_every(&self) -> usize {
        (self.save_interval_secs / self.log_interval_secs.max(1)).max(1) as usize
    }

    /// Base path for the log files.
    pub fn resolved_save_path(&self) -> PathBuf {
        self.save_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("data").join("gefran"))
    }
}

pub(crate) fn validate_datetime_format(format: &str) -> PidResult<()> {
    let mut probe = String::new();
    let formatted = chrono::Local::now().format(format);
    if format.is_empty() || write!(probe, "{formatted}").is_err() {
        return Err(PidError::Configuration(format!(
            "Invalid datetime_format '{format}'"
        )));
    }
    Ok(())
}
