//! Record types kept by the sample stores.

use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, Local};

/// Column heading for process values.
pub const PV_HEADING: &str = "Process value (°C)";
/// Column heading for setpoints.
pub const SP_HEADING: &str = "Setpoint value (°C)";
/// Column heading for command descriptions.
pub const COMMAND_HEADING: &str = "Command";

/// A row that can be appended to a [`super::SampleStore`] and written as CSV.
pub trait Record: Clone + Send + Sync + 'static {
    /// Headings of the record-specific columns (after the time columns).
    fn value_headings() -> &'static [&'static str];

    /// Wall-clock time the record was taken.
    fn timestamp(&self) -> DateTime<Local>;

    /// Monotonic offset from the start of the store.
    fn elapsed(&self) -> Duration;

    /// Record-specific column values.
    fn values(&self) -> Vec<String>;
}

/// One temperature observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Wall-clock time of the reading
    pub timestamp: DateTime<Local>,
    /// Offset from the start of the temperature log
    pub elapsed: Duration,
    /// Measured temperature in °C
    pub process_value: f64,
    /// Setpoint in °C at the time of the reading
    pub setpoint: f64,
}

impl Record for Sample {
    fn value_headings() -> &'static [&'static str] {
        &[PV_HEADING, SP_HEADING]
    }

    fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn values(&self) -> Vec<String> {
        vec![self.process_value.to_string(), self.setpoint.to_string()]
    }
}

/// One user-visible action (setpoint change, wait, stabilization start/end).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    /// Wall-clock time of the action
    pub timestamp: DateTime<Local>,
    /// Offset from the start of the command log
    pub elapsed: Duration,
    /// What was done, e.g. `Set setpoint to 185.50°C`
    pub description: String,
}

impl Record for CommandRecord {
    fn value_headings() -> &'static [&'static str] {
        &[COMMAND_HEADING]
    }

    fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn values(&self) -> Vec<String> {
        vec![self.description.clone()]
    }
}

/// Time columns shared by both logs: formatted time, seconds, minutes, hours.
pub(crate) fn time_headings(datetime_format: &str) -> [String; 4] {
    [
        format!("Time ({datetime_format})"),
        "Time (s)".to_string(),
        "Time (min)".to_string(),
        "Time (hour)".to_string(),
    ]
}

/// Fails when `datetime_format` holds a specifier chrono cannot render.
pub(crate) fn time_values<R: Record>(
    record: &R,
    datetime_format: &str,
) -> Result<[String; 4], std::fmt::Error> {
    let secs = record.elapsed().as_secs_f64();
    let mut formatted = String::new();
    write!(formatted, "{}", record.timestamp().format(datetime_format))?;
    Ok([
        formatted,
        format!("{secs:.3}"),
        format!("{:.4}", secs / 60.0),
        format!("{:.6}", secs / 3600.0),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_columns() {
        let record = CommandRecord {
            timestamp: Local::now(),
            elapsed: Duration::from_secs(90),
            description: "START".to_string(),
        };
        let values = time_values(&record, "%H:%M").unwrap();
        assert_eq!(values[1], "90.000");
        assert_eq!(values[2], "1.5000");
        assert_eq!(values[3], "0.025000");
        assert_eq!(time_headings("%H:%M")[0], "Time (%H:%M)");
    }

    #[test]
    fn test_unknown_specifier_is_an_error() {
        let record = CommandRecord {
            timestamp: Local::now(),
            elapsed: Duration::ZERO,
            description: "START".to_string(),
        };
        assert!(time_values(&record, "%Q").is_err());
    }

    #[test]
    fn test_sample_values_follow_headings() {
        let sample = Sample {
            timestamp: Local::now(),
            elapsed: Duration::ZERO,
            process_value: 185.5,
            setpoint: 200.0,
        };
        assert_eq!(Sample::value_headings(), &[PV_HEADING, SP_HEADING]);
        assert_eq!(sample.values(), vec!["185.5", "200"]);
    }
}
