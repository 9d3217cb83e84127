//! Temperature stabilization monitor.
//!
//! [`DeviceSession::wait_until_stable`] samples the controller once per log
//! interval and evaluates a stability predicate over the most recent `n`
//! samples until it holds or the optional timeout elapses. Polling is parked
//! for the duration of the wait and resumed afterwards, also when the wait
//! future is dropped before it completes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PidError, PidResult};
use crate::session::DeviceSession;

/// Command log entry written when a wait begins.
pub const WAITING_MESSAGE: &str = "Waiting for temperature to stabilize";
/// Command log entry written when a wait ends on its timeout.
pub const TIMED_OUT_MESSAGE: &str = "Temperature has not stabilized, wait has timed out";
/// Command log entry written when the predicate holds.
pub const STABILIZED_MESSAGE: &str = "Temperature has stabilized";

/// Parameters of a stabilization wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityCriteria {
    /// Number of most recent samples handed to the predicate
    pub n: usize,
    /// Maximum |PV - SP| accepted by the default predicate, in °C
    pub tolerance: f64,
    /// Give up after this long; wait forever if `None`
    pub timeout: Option<Duration>,
}

impl Default for StabilityCriteria {
    fn default() -> Self {
        Self {
            n: 10,
            tolerance: 1.5,
            timeout: None,
        }
    }
}

impl StabilityCriteria {
    /// Set the window size `n`.
    pub fn with_samples(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    /// Set the tolerance of the default predicate.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Give up after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject an empty window and non-positive or non-finite tolerances.
    pub fn validate(&self) -> PidResult<()> {
        if self.n == 0 {
            return Err(PidError::Configuration(
                "stability window must hold at least one sample".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(PidError::Configuration(format!(
                "stability tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// The samples a predicate decides on.
#[derive(Debug, Clone, Copy)]
pub struct StabilityWindow<'a> {
    /// Seconds since the start of the temperature log, oldest first
    pub times: &'a [f64],
    /// Process values matching `times`
    pub temps: &'a [f64],
    /// Setpoint of the newest sample
    pub setpoint: f64,
}

/// Decides whether a window of samples counts as stable.
///
/// Implemented for any `Fn(&StabilityWindow) -> bool`, so closures can carry
/// their own parameters:
///
/// ```
/// use gefran_pid::stability::{StabilityPredicate, StabilityWindow};
///
/// let max_drift = 0.5;
/// let flat = move |w: &StabilityWindow<'_>| {
///     let lo = w.temps.iter().copied().fold(f64::INFINITY, f64::min);
///     let hi = w.temps.iter().copied().fold(f64::NEG_INFINITY, f64::max);
///     hi - lo < max_drift
/// };
/// let window = StabilityWindow { times: &[0.0, 5.0], temps: &[20.1, 20.3], setpoint: 25.0 };
/// assert!(flat.is_stable(&window));
/// ```
pub trait StabilityPredicate: Send + Sync {
    /// `true` if the window counts as stable.
    fn is_stable(&self, window: &StabilityWindow<'_>) -> bool;
}

impl<F> StabilityPredicate for F
where
    F: Fn(&StabilityWindow<'_>) -> bool + Send + Sync,
{
    fn is_stable(&self, window: &StabilityWindow<'_>) -> bool {
        self(window)
    }
}

/// Default predicate: every process value is strictly within `tolerance` of
/// the setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WithinTolerance {
    /// Largest accepted |PV - SP|, exclusive
    pub tolerance: f64,
}

impl StabilityPredicate for WithinTolerance {
    fn is_stable(&self, window: &StabilityWindow<'_>) -> bool {
        window
            .temps
            .iter()
            .all(|pv| (pv - window.setpoint).abs() < self.tolerance)
    }
}

impl DeviceSession {
    /// Wait until the last `criteria.n` process values are all within
    /// `criteria.tolerance` of the setpoint.
    ///
    /// Returns `false` if `criteria.timeout` elapses first.
    pub async fn wait_until_stable(&self, criteria: StabilityCriteria) -> PidResult<bool> {
        let predicate = WithinTolerance {
            tolerance: criteria.tolerance,
        };
        self.wait_until_stable_with(criteria, &predicate).await
    }

    /// Wait until `predicate` holds over the last `criteria.n` samples.
    ///
    /// Fails with [`PidError::Busy`] if another wait is in progress. On a
    /// communication error the session is left idle and polling is not
    /// resumed. Cancelling the wait (for example with `tokio::time::timeout`)
    /// is safe: the session returns to `Idle` and a parked poller restarts.
    pub async fn wait_until_stable_with(
        &self,
        criteria: StabilityCriteria,
        predicate: &dyn StabilityPredicate,
    ) -> PidResult<bool> {
        criteria.validate()?;
        let (mut guard, parked) = self.enter_stabilizing()?;
        if let Some(task) = parked {
            if let Err(e) = task.stop().await {
                warn!("Polling ended with an error before the wait: {}", e);
            }
        }

        let outcome = match self.shared.register_command(WAITING_MESSAGE).await {
            Ok(()) => self.monitor(&criteria, predicate).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(stable) => {
                drop(guard);
                let message = if stable {
                    STABILIZED_MESSAGE
                } else {
                    TIMED_OUT_MESSAGE
                };
                self.shared.register_command(message).await?;
                Ok(stable)
            }
            Err(e) => {
                guard.keep_idle();
                Err(e)
            }
        }
    }

    async fn monitor(
        &self,
        criteria: &StabilityCriteria,
        predicate: &dyn StabilityPredicate,
    ) -> PidResult<bool> {
        let started = Instant::now();
        loop {
            if let Some(timeout) = criteria.timeout {
                if started.elapsed() >= timeout {
                    return Ok(false);
                }
            }

            tokio::time::sleep(self.shared.log_interval).await;
            self.shared.record_sample().await?;

            let (times, temps, setpoint) = {
                let store = self.shared.temperature.lock().await;
                let window = store.tail(criteria.n);
                if window.len() < criteria.n {
                    continue;
                }
                let times: Vec<f64> = window.iter().map(|s| s.elapsed.as_secs_f64()).collect();
                let temps: Vec<f64> = window.iter().map(|s| s.process_value).collect();
                let setpoint = window.last().map_or(f64::NAN, |s| s.setpoint);
                (times, temps, setpoint)
            };

            let window = StabilityWindow {
                times: &times,
                temps: &temps,
                setpoint,
            };
            if predicate.is_stable(&window) {
                return Ok(true);
            }
            debug!(
                "Not stable yet: last PV {:?} against SP {}",
                temps.last(),
                setpoint
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window<'a>(temps: &'a [f64], times: &'a [f64]) -> StabilityWindow<'a> {
        StabilityWindow {
            times,
            temps,
            setpoint: 200.0,
        }
    }

    #[test]
    fn test_within_tolerance() {
        let predicate = WithinTolerance { tolerance: 1.5 };
        let times = [0.0, 5.0, 10.0];
        assert!(predicate.is_stable(&window(&[199.0, 200.8, 199.9], &times)));
        assert!(!predicate.is_stable(&window(&[199.0, 202.0, 199.9], &times)));
    }

    #[test]
    fn test_tolerance_bound_is_strict() {
        let predicate = WithinTolerance { tolerance: 1.5 };
        assert!(!predicate.is_stable(&window(&[201.5], &[0.0])));
    }

    #[test]
    fn test_closure_predicate() {
        let predicate = |w: &StabilityWindow<'_>| w.times.len() == 2;
        assert!(predicate.is_stable(&window(&[1.0, 2.0], &[0.0, 5.0])));
    }

    #[test]
    fn test_criteria_defaults_and_validation() {
        let criteria = StabilityCriteria::default();
        assert_eq!(criteria.n, 10);
        assert_eq!(criteria.tolerance, 1.5);
        assert_eq!(criteria.timeout, None);
        assert!(criteria.validate().is_ok());

        assert!(criteria.with_samples(0).validate().is_err());
        assert!(criteria.with_tolerance(0.0).validate().is_err());
        assert!(criteria.with_tolerance(f64::NAN).validate().is_err());
    }
}
