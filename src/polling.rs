//! Background temperature polling.
//!
//! While polling is active a spawned task samples PV and SP once per log
//! interval and appends them to the temperature log. The task is stopped
//! through a oneshot shutdown channel and joined, so once
//! [`DeviceSession::stop_polling`] returns no further sample is appended.
//!
//! The shutdown sender is dropped with the task handle, so a `stop` whose
//! future is cancelled still ends the loop.
//!
//! A communication or storage error ends the loop. The error is logged
//! immediately and handed back by the next `stop_polling` call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{PidError, PidResult};
use crate::session::{Activity, DeviceSession, Shared};

/// Handle to a running polling loop.
pub(crate) struct PollingTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<PidResult<()>>,
}

impl PollingTask {
    pub(crate) fn spawn(shared: Arc<Shared>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Temperature polling shutdown requested");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = shared.record_sample().await {
                            warn!("Temperature polling stopped: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
            info!("Temperature polling stopped");
            Ok(())
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the loop and wait for it to exit, returning its result.
    pub(crate) async fn stop(self) -> PidResult<()> {
        let _ = self.shutdown_tx.send(());
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Temperature polling task did not finish cleanly: {}", e);
                Ok(())
            }
        }
    }

    pub(crate) fn abort(self) {
        self.handle.abort();
    }
}

impl DeviceSession {
    /// Start sampling PV and SP in the background every log interval.
    ///
    /// Calling this while polling is already running is a no-op. A poller
    /// that ended on an error is replaced. Fails with
    /// [`PidError::Busy`] during a stabilization wait.
    pub async fn start_polling(&self) -> PidResult<()> {
        if !self.is_connected().await {
            return Err(PidError::not_connected());
        }

        let stale = {
            let mut controller = self.lock_controller();
            match controller.activity {
                Activity::Stabilizing => {
                    return Err(PidError::Busy(
                        "cannot start polling during a stabilization wait".to_string(),
                    ))
                }
                Activity::Polling
                    if controller
                        .task
                        .as_ref()
                        .is_some_and(|task| !task.is_finished()) =>
                {
                    return Ok(());
                }
                _ => {}
            }
            let stale = controller.task.take();
            self.spawn_polling(&mut controller);
            stale
        };

        if let Some(task) = stale {
            if let Err(e) = task.stop().await {
                warn!("Restarting polling after error: {}", e);
            }
        }
        Ok(())
    }

    /// Stop background sampling and wait for the loop to exit.
    ///
    /// Returns the error that ended the loop early, if any. Stopping an idle
    /// session is a no-op.
    pub async fn stop_polling(&self) -> PidResult<()> {
        let task = {
            let mut controller = self.lock_controller();
            if controller.activity == Activity::Stabilizing {
                return Err(PidError::Busy(
                    "polling is parked by a stabilization wait".to_string(),
                ));
            }
            controller.activity = Activity::Idle;
            controller.task.take()
        };
        match task {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    /// Whether the background poller is running.
    pub async fn is_polling(&self) -> bool {
        let controller = self.lock_controller();
        controller.activity == Activity::Polling
            && controller
                .task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PidConfig;
    use crate::transport::MockTransport;

    fn connected_mock() -> MockTransport {
        MockTransport::new()
            .with_register(136, 1)
            .with_register(0, 250)
            .with_register(55, 300)
    }

    fn session(mock: &MockTransport) -> DeviceSession {
        let config = PidConfig {
            save_log: false,
            ..PidConfig::for_port("mock")
        };
        DeviceSession::new(&config, Box::new(mock.clone())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_samples_every_interval() {
        let mock = connected_mock();
        let session = session(&mock);
        session.connect().await.unwrap();

        session.start_polling().await.unwrap();
        assert!(session.is_polling().await);
        tokio::time::sleep(Duration::from_millis(15_500)).await;
        session.stop_polling().await.unwrap();

        let samples = session.samples().await;
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].process_value, 25.0);
        assert_eq!(samples[0].setpoint, 30.0);
        assert!(samples[1].elapsed >= Duration::from_secs(10));
        assert!(samples[1].elapsed < Duration::from_secs(11));
        assert!(!session.is_polling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polling_is_idempotent() {
        let mock = connected_mock();
        let session = session(&mock);
        session.connect().await.unwrap();

        session.start_polling().await.unwrap();
        session.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        session.stop_polling().await.unwrap();
        session.stop_polling().await.unwrap();

        assert_eq!(session.samples().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sample_after_stop() {
        let mock = connected_mock();
        let session = session(&mock);
        session.connect().await.unwrap();

        session.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        session.stop_polling().await.unwrap();
        let reads = mock.read_count(0);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(mock.read_count(0), reads);
        assert_eq!(session.samples().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_error_ends_loop_and_is_reported_on_stop() {
        let mock = connected_mock();
        let session = session(&mock);
        session.connect().await.unwrap();

        session.start_polling().await.unwrap();
        mock.inject_next_failure();
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert!(!session.is_polling().await);
        let err = session.stop_polling().await.unwrap_err();
        assert!(matches!(err, PidError::Communication { .. }));
        assert!(session.samples().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_polling_requires_connection() {
        let mock = connected_mock();
        let session = session(&mock);
        let err = session.start_polling().await.unwrap_err();
        assert!(matches!(err, PidError::Connection { .. }));
        assert_eq!(session.activity().await, Activity::Idle);
    }
}
