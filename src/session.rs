//! Device session for a Gefran PID controller.
//!
//! A [`DeviceSession`] owns the register transport and the two sample
//! stores. All register access goes through a session-owned async mutex; each
//! compound operation (read decimal point, then read or write the value) runs
//! under a single acquisition so a concurrent caller can never change the
//! scale factor halfway through a conversion.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──► connect() ──► start_polling() / wait_until_stable() ... ──► disconnect()
//! ```
//!
//! The session's activity is an explicit state machine:
//!
//! - `Idle`: no background work
//! - `Polling`: the background sampling task is running
//! - `Stabilizing`: a stabilization wait is sampling in the foreground
//!
//! `Polling` and `Stabilizing` are mutually exclusive. A stabilization wait
//! parks a running poller and resumes it afterwards.
//!
//! The activity lives behind a plain `std::sync::Mutex` that is never held
//! across an await, so it can be reset from `Drop`: a stabilization wait
//! whose future is dropped (by `tokio::time::timeout`, `select!` or task
//! abort) still returns the session to `Idle` and resumes a parked poller.
//!
//! Dropping a session aborts the poller, makes a best-effort flush of both
//! logs and drops the transport, which closes the serial port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{raw_to_word, word_to_raw, ScaleFactor};
use crate::config::{validate_datetime_format, PidConfig, RegisterMap};
use crate::error::{PidError, PidResult, CONNECT_HINT};
use crate::polling::PollingTask;
use crate::store::{CommandRecord, LogPaths, Sample, SampleStore};
use crate::transport::{read_single, RegisterTransport, TransportError};

/// Command log entry written by a successful first connect.
pub const START_COMMAND: &str = "START";

/// What the session is currently doing in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// No background work
    Idle,
    /// The background poller is sampling
    Polling,
    /// A stabilization wait is sampling in the foreground
    Stabilizing,
}

struct Link {
    transport: Box<dyn RegisterTransport>,
    started: bool,
}

impl Link {
    fn connected(&mut self) -> PidResult<&mut (dyn RegisterTransport + 'static)> {
        if !self.transport.is_open() {
            return Err(PidError::not_connected());
        }
        Ok(self.transport.as_mut())
    }
}

/// State shared between the session handle and its polling task.
pub(crate) struct Shared {
    device_id: u8,
    registers: RegisterMap,
    pub(crate) log_interval: Duration,
    link: Mutex<Link>,
    /// Cleared as soon as a disconnect starts; a parked poller is only
    /// resumed while this is set.
    connected: AtomicBool,
    pub(crate) temperature: Mutex<SampleStore<Sample>>,
    pub(crate) commands: Mutex<SampleStore<CommandRecord>>,
}

impl Shared {
    async fn read_scale(&self, transport: &mut dyn RegisterTransport) -> PidResult<ScaleFactor> {
        let word = read_single(transport, self.device_id, self.registers.decimal_point)
            .await
            .map_err(|e| PidError::communication("read decimal point", e))?;
        ScaleFactor::from_register(word).ok_or_else(|| {
            PidError::communication(
                "read decimal point",
                TransportError::Malformed(format!("decimal point register holds {word}")),
            )
        })
    }

    async fn read_scaled(&self, address: u16, operation: &'static str) -> PidResult<f64> {
        let mut link = self.link.lock().await;
        let transport = link.connected()?;
        let scale = self.read_scale(transport).await?;
        let word = read_single(transport, self.device_id, address)
            .await
            .map_err(|e| PidError::communication(operation, e))?;
        let value = scale.to_physical(word_to_raw(word));
        debug!(
            "{}: raw {} with {} decimal(s) -> {}",
            operation,
            word_to_raw(word),
            scale.decimals(),
            value
        );
        Ok(value)
    }

    pub(crate) async fn read_process_value(&self) -> PidResult<f64> {
        self.read_scaled(self.registers.process_value, "read process value")
            .await
    }

    pub(crate) async fn read_setpoint(&self) -> PidResult<f64> {
        self.read_scaled(self.registers.setpoint, "read setpoint").await
    }

    async fn write_setpoint(&self, value: f64) -> PidResult<u16> {
        let mut link = self.link.lock().await;
        let transport = link.connected()?;
        let scale = self.read_scale(transport).await?;
        let word = raw_to_word(scale.to_raw(value)?);
        transport
            .write_multiple_registers(self.device_id, self.registers.setpoint, &[word])
            .await
            .map_err(|e| PidError::communication("write setpoint", e))?;
        Ok(word)
    }

    /// Read PV and SP and append them to the temperature log.
    pub(crate) async fn record_sample(&self) -> PidResult<Sample> {
        let process_value = self.read_process_value().await?;
        let setpoint = self.read_setpoint().await?;
        let mut store = self.temperature.lock().await;
        let sample = Sample {
            timestamp: Local::now(),
            elapsed: store.elapsed(),
            process_value,
            setpoint,
        };
        if store.append(sample.clone())? {
            debug!("Temperature log checkpoint after {} samples", store.len());
        }
        Ok(sample)
    }

    pub(crate) async fn register_command(&self, description: impl Into<String>) -> PidResult<()> {
        let mut store = self.commands.lock().await;
        let record = CommandRecord {
            timestamp: Local::now(),
            elapsed: store.elapsed(),
            description: description.into(),
        };
        info!("Command: {}", record.description);
        store.append(record)?;
        Ok(())
    }

    async fn flush_logs(&self) -> Vec<PidError> {
        let mut errors = Vec::new();
        if let Err(e) = self.temperature.lock().await.flush() {
            warn!("Could not save temperature log: {}", e);
            errors.push(e);
        }
        if let Err(e) = self.commands.lock().await.flush() {
            warn!("Could not save command log: {}", e);
            errors.push(e);
        }
        errors
    }
}

pub(crate) struct Controller {
    pub(crate) activity: Activity,
    pub(crate) task: Option<PollingTask>,
}

/// Connection to one controller on a Modbus RTU link.
pub struct DeviceSession {
    pub(crate) shared: Arc<Shared>,
    controller: SyncMutex<Controller>,
    log_paths: Option<LogPaths>,
    port: String,
}

impl DeviceSession {
    /// Create an unopened session over `transport`.
    ///
    /// When `config.save_log` is set the log file paths are resolved (and
    /// their directory created) immediately.
    pub fn new(config: &PidConfig, transport: Box<dyn RegisterTransport>) -> PidResult<Self> {
        if config.log_interval_secs == 0 {
            return Err(PidError::Configuration(
                "'log_interval_secs' must be at least 1".to_string(),
            ));
        }
        validate_datetime_format(&config.datetime_format)?;

        let format = config.datetime_format.clone();
        let save_every = config.save_every();
        let (log_paths, temperature, commands) = if config.save_log {
            let paths = LogPaths::resolve(&config.resolved_save_path(), Local::now())?;
            let temperature = SampleStore::with_csv(&paths.temperature, save_every, &*format);
            let commands = SampleStore::with_csv(&paths.commands, 1, &*format);
            (Some(paths), temperature, commands)
        } else {
            (
                None,
                SampleStore::in_memory(save_every, &*format),
                SampleStore::in_memory(1, &*format),
            )
        };

        Ok(Self {
            shared: Arc::new(Shared {
                device_id: config.device_id,
                registers: config.registers,
                log_interval: config.log_interval(),
                link: Mutex::new(Link {
                    transport,
                    started: false,
                }),
                connected: AtomicBool::new(false),
                temperature: Mutex::new(temperature),
                commands: Mutex::new(commands),
            }),
            controller: SyncMutex::new(Controller {
                activity: Activity::Idle,
                task: None,
            }),
            log_paths,
            port: config.port.clone(),
        })
    }

    /// Validate `config`, open the serial port and connect.
    #[cfg(feature = "instrument_serial")]
    pub async fn connect_serial(config: &PidConfig) -> PidResult<Self> {
        use crate::transport::{RtuTransport, SerialSettings};

        config.validate()?;
        let settings = SerialSettings {
            port: config.port.clone(),
            baud_rate: config.baud_rate,
            response_timeout: config.response_timeout(),
        };
        let session = Self::new(config, Box::new(RtuTransport::new(settings)))?;
        session.connect().await?;
        Ok(session)
    }

    /// Open the transport. Reopens it if the session is already connected.
    pub async fn connect(&self) -> PidResult<()> {
        let first = {
            let mut link = self.shared.link.lock().await;
            if let Err(e) = link.transport.open().await {
                warn!("Could not connect to '{}': {}", self.port, e);
                return Err(PidError::Connection {
                    message: CONNECT_HINT.to_string(),
                    source: Some(e),
                });
            }
            self.shared.connected.store(true, Ordering::SeqCst);
            !std::mem::replace(&mut link.started, true)
        };
        info!("Connected to PID controller on '{}'", self.port);

        if first {
            self.shared.register_command(START_COMMAND).await?;
        }
        Ok(())
    }

    /// Stop polling, save both logs and close the transport.
    ///
    /// The logs are saved before the close is attempted. Save and close
    /// failures are all reported; several of them come back as
    /// [`PidError::DisconnectFailed`].
    pub async fn disconnect(&self) -> PidResult<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        match self.stop_polling().await {
            Ok(()) => {}
            Err(PidError::Busy(_)) => {
                info!("Polling is parked by a stabilization wait and will not be resumed");
            }
            Err(e) => warn!("Polling ended with an error before disconnect: {}", e),
        }

        let mut errors = self.shared.flush_logs().await;

        {
            let mut link = self.shared.link.lock().await;
            if link.transport.is_open() {
                if let Err(e) = link.transport.close().await {
                    warn!("Could not disconnect from '{}': {}", self.port, e);
                    errors.push(PidError::Connection {
                        message: "Could not disconnect from the PID controller".to_string(),
                        source: Some(e),
                    });
                }
            }
        }

        match errors.len() {
            0 => {
                info!("Disconnected from PID controller on '{}'", self.port);
                Ok(())
            }
            1 => Err(errors.remove(0)),
            _ => Err(PidError::DisconnectFailed(errors)),
        }
    }

    /// Whether the transport is open.
    pub async fn is_connected(&self) -> bool {
        self.shared.link.lock().await.transport.is_open()
    }

    /// Read the decimal-point setting currently configured on the controller.
    pub async fn read_scale(&self) -> PidResult<ScaleFactor> {
        let mut link = self.shared.link.lock().await;
        let transport = link.connected()?;
        self.shared.read_scale(transport).await
    }

    /// Current process value in °C.
    pub async fn read_process_value(&self) -> PidResult<f64> {
        self.shared.read_process_value().await
    }

    /// Current setpoint in °C.
    pub async fn read_setpoint(&self) -> PidResult<f64> {
        self.shared.read_setpoint().await
    }

    /// Write a new setpoint in °C and log the command.
    pub async fn write_setpoint(&self, value: f64) -> PidResult<()> {
        let word = self.shared.write_setpoint(value).await?;
        debug!("Setpoint {} written as raw {}", value, word_to_raw(word));
        self.shared
            .register_command(format!("Set setpoint to {value:.2}°C"))
            .await
    }

    /// Take one PV/SP sample and append it to the temperature log.
    pub async fn sample(&self) -> PidResult<Sample> {
        self.shared.record_sample().await
    }

    /// Sleep for `duration`, logging the start and end of the wait.
    pub async fn wait(&self, duration: Duration) -> PidResult<()> {
        self.shared
            .register_command(format!("Wait for {}s", duration.as_secs_f64()))
            .await?;
        tokio::time::sleep(duration).await;
        self.shared.register_command("Wait end").await
    }

    /// Save both logs now.
    ///
    /// When both saves fail the errors come back as [`PidError::SaveFailed`].
    pub async fn save_logs(&self) -> PidResult<()> {
        let mut errors = self.shared.flush_logs().await;
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PidError::SaveFailed(errors)),
        }
    }

    /// Snapshot of the temperature log.
    pub async fn samples(&self) -> Vec<Sample> {
        self.shared.temperature.lock().await.records().to_vec()
    }

    /// Snapshot of the command log.
    pub async fn commands(&self) -> Vec<CommandRecord> {
        self.shared.commands.lock().await.records().to_vec()
    }

    /// CSV files used by this session, if logging to disk is enabled.
    pub fn log_paths(&self) -> Option<&LogPaths> {
        self.log_paths.as_ref()
    }

    /// Sampling interval of the poller and the stabilization monitor.
    pub fn log_interval(&self) -> Duration {
        self.shared.log_interval
    }

    /// Current activity.
    pub async fn activity(&self) -> Activity {
        self.lock_controller().activity
    }

    pub(crate) fn lock_controller(&self) -> MutexGuard<'_, Controller> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enter `Stabilizing` and take the poller out of the session.
    ///
    /// The caller stops the returned task; the guard restores `Idle` (and
    /// resumes polling if it was running) when dropped.
    pub(crate) fn enter_stabilizing(
        &self,
    ) -> PidResult<(StabilizingGuard<'_>, Option<PollingTask>)> {
        let mut controller = self.lock_controller();
        if controller.activity == Activity::Stabilizing {
            return Err(PidError::Busy(
                "a stabilization wait is already in progress".to_string(),
            ));
        }
        let parked = controller.task.take();
        let resume = controller.activity == Activity::Polling
            && parked.as_ref().is_some_and(|task| !task.is_finished());
        controller.activity = Activity::Stabilizing;
        Ok((
            StabilizingGuard {
                session: self,
                resume,
            },
            parked,
        ))
    }

    pub(crate) fn spawn_polling(&self, controller: &mut Controller) {
        controller.task = Some(PollingTask::spawn(
            Arc::clone(&self.shared),
            self.shared.log_interval,
        ));
        controller.activity = Activity::Polling;
        info!(
            "Temperature polling started on '{}' every {:?}",
            self.port, self.shared.log_interval
        );
    }
}

/// Held for the duration of a stabilization wait.
///
/// Dropping it, on any path out of the wait, returns the session to `Idle`
/// and restarts the poller that was parked, unless the link has been closed
/// in the meantime.
pub(crate) struct StabilizingGuard<'a> {
    session: &'a DeviceSession,
    resume: bool,
}

impl StabilizingGuard<'_> {
    /// Leave the session idle even if polling ran before the wait.
    pub(crate) fn keep_idle(&mut self) {
        self.resume = false;
    }
}

impl Drop for StabilizingGuard<'_> {
    fn drop(&mut self) {
        let mut controller = self.session.lock_controller();
        controller.activity = Activity::Idle;
        if !self.resume {
            return;
        }
        if !self.session.shared.connected.load(Ordering::SeqCst) {
            debug!("Link closed during the wait, polling not resumed");
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Polling not resumed: no tokio runtime");
            return;
        }
        self.session.spawn_polling(&mut controller);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let parked = self.lock_controller().task.take();
        if let Some(task) = parked {
            task.abort();
        }
        if let Ok(mut store) = self.shared.temperature.try_lock() {
            if let Err(e) = store.flush() {
                warn!("Could not save temperature log on drop: {}", e);
            }
        }
        if let Ok(mut store) = self.shared.commands.try_lock() {
            if let Err(e) = store.flush() {
                warn!("Could not save command log on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stability::StabilityCriteria;
    use crate::transport::MockTransport;
    use tracing_test::traced_test;

    fn session(mock: &MockTransport) -> DeviceSession {
        let config = PidConfig {
            save_log: false,
            ..PidConfig::for_port("mock")
        };
        DeviceSession::new(&config, Box::new(mock.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_ops_before_connect_fail_with_connection_error() {
        let mock = MockTransport::new().with_register(136, 1);
        let session = session(&mock);
        let err = session.read_process_value().await.unwrap_err();
        assert!(matches!(err, PidError::Connection { .. }));
        assert!(mock.call_log().is_empty());
    }

    #[tokio::test]
    async fn test_scale_is_read_before_every_value() {
        let mock = MockTransport::new()
            .with_register(136, 1)
            .with_register(0, 250)
            .with_register(55, 300);
        let session = session(&mock);
        session.connect().await.unwrap();

        assert_eq!(session.read_process_value().await.unwrap(), 25.0);
        assert_eq!(session.read_setpoint().await.unwrap(), 30.0);
        assert_eq!(
            mock.call_log(),
            vec!["open", "read 1 136 1", "read 1 0 1", "read 1 136 1", "read 1 55 1"]
        );
    }

    #[tokio::test]
    async fn test_scale_change_between_calls_is_honoured() {
        let mock = MockTransport::new()
            .with_register(136, 1)
            .with_register(0, 1234);
        let session = session(&mock);
        session.connect().await.unwrap();
        assert_eq!(session.read_process_value().await.unwrap(), 123.4);
        mock.set_register(136, 2);
        assert_eq!(session.read_process_value().await.unwrap(), 12.34);
    }

    #[tokio::test]
    async fn test_out_of_range_decimal_point_is_communication_error() {
        let mock = MockTransport::new().with_register(136, 9);
        let session = session(&mock);
        session.connect().await.unwrap();
        let err = session.read_setpoint().await.unwrap_err();
        assert!(matches!(err, PidError::Communication { .. }));
    }

    #[tokio::test]
    async fn test_negative_process_value() {
        let mock = MockTransport::new()
            .with_register(136, 1)
            .with_register(0, raw_to_word(-125));
        let session = session(&mock);
        session.connect().await.unwrap();
        assert_eq!(session.read_process_value().await.unwrap(), -12.5);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_failure_is_logged() {
        let mock = MockTransport::new();
        mock.fail_open(true);
        let session = session(&mock);
        assert!(session.connect().await.is_err());
        assert!(logs_contain("Could not connect to 'mock'"));

        mock.fail_open(false);
        session.connect().await.unwrap();
        assert!(logs_contain("Connected to PID controller on 'mock'"));
        assert!(logs_contain("Command: START"));
    }

    #[tokio::test]
    async fn test_start_command_only_on_first_connect() {
        let mock = MockTransport::new();
        let session = session(&mock);
        session.connect().await.unwrap();
        session.connect().await.unwrap();
        let commands = session.commands().await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].description, START_COMMAND);
        assert_eq!(mock.call_log(), vec!["open", "open"]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_disconnect_during_wait_leaves_poller_parked() {
        let mock = MockTransport::new()
            .with_register(136, 1)
            .with_register(0, 1500)
            .with_register(55, 2000);
        let session = session(&mock);
        session.connect().await.unwrap();
        session.start_polling().await.unwrap();

        let (waited, closed) = tokio::join!(
            tokio::time::timeout(
                Duration::from_secs(7),
                session.wait_until_stable(StabilityCriteria::default()),
            ),
            async {
                tokio::time::sleep(Duration::from_secs(6)).await;
                session.disconnect().await
            },
        );

        assert!(waited.is_err());
        closed.unwrap();
        assert!(!session.is_polling().await);
        assert_eq!(session.activity().await, Activity::Idle);
        assert!(logs_contain("Polling is parked by a stabilization wait"));
        assert!(!logs_contain("Polling ended with an error before disconnect"));
    }
}
