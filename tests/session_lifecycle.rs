//! Session lifecycle, register access and log persistence against the mock
//! register bank.

use std::time::Duration;

use gefran_pid::codec::raw_to_word;
use gefran_pid::store::{PV_HEADING, SP_HEADING};
use gefran_pid::{Activity, DeviceSession, MockTransport, PidConfig, PidError};
use tokio_test::{assert_err, assert_ok};

const DECIMAL_POINT: u16 = 136;
const PROCESS_VALUE: u16 = 0;
const SETPOINT: u16 = 55;

fn controller() -> MockTransport {
    MockTransport::new()
        .with_register(DECIMAL_POINT, 1)
        .with_register(PROCESS_VALUE, 1843)
        .with_register(SETPOINT, 1800)
}

fn memory_config() -> PidConfig {
    PidConfig {
        save_log: false,
        ..PidConfig::for_port("mock")
    }
}

fn disk_config(dir: &tempfile::TempDir) -> PidConfig {
    PidConfig {
        save_path: Some(dir.path().join("logs").join("oven")),
        log_interval_secs: 5,
        save_interval_secs: 10,
        ..PidConfig::for_port("mock")
    }
}

async fn connected(mock: &MockTransport, config: &PidConfig) -> DeviceSession {
    let session = DeviceSession::new(config, Box::new(mock.clone())).unwrap();
    session.connect().await.unwrap();
    session
}

#[tokio::test]
async fn setpoint_is_scaled_by_decimal_point() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;

    assert_ok!(session.write_setpoint(185.5).await);
    assert_eq!(mock.register(SETPOINT), 1855);
    assert_eq!(session.read_setpoint().await.unwrap(), 185.5);
    assert_eq!(session.read_process_value().await.unwrap(), 184.3);

    let commands = session.commands().await;
    assert_eq!(commands.last().unwrap().description, "Set setpoint to 185.50°C");
}

#[tokio::test]
async fn setpoint_write_uses_current_decimal_point() {
    let mock = controller().with_register(DECIMAL_POINT, 0);
    let session = connected(&mock, &memory_config()).await;

    session.write_setpoint(-20.0).await.unwrap();
    assert_eq!(mock.register(SETPOINT), raw_to_word(-20));
    assert!(mock.call_log().contains(&"write 1 55 [65516]".to_string()));
}

#[tokio::test]
async fn unrepresentable_setpoint_is_rejected_before_writing() {
    let mock = controller().with_register(DECIMAL_POINT, 2);
    let session = connected(&mock, &memory_config()).await;

    let err = session.write_setpoint(400.0).await.unwrap_err();
    assert!(matches!(err, PidError::Configuration(_)));
    assert!(!mock.call_log().iter().any(|call| call.starts_with("write")));
}

#[tokio::test]
async fn failed_connect_carries_port_hint() {
    let mock = controller();
    mock.fail_open(true);
    let session = DeviceSession::new(&memory_config(), Box::new(mock.clone())).unwrap();

    let err = session.connect().await.unwrap_err();
    assert!(err.to_string().contains("make sure the right port was selected"));
    assert!(std::error::Error::source(&err).is_some());
    assert!(!session.is_connected().await);
    assert!(session.commands().await.is_empty());
}

#[tokio::test]
async fn read_failure_is_communication_error() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;

    mock.inject_next_failure();
    let err = session.read_process_value().await.unwrap_err();
    assert!(matches!(
        err,
        PidError::Communication {
            operation: "read decimal point",
            ..
        }
    ));
    assert_ok!(session.read_process_value().await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_polling_stops_before_close() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;

    session.start_polling().await.unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_ok!(session.disconnect().await);

    let log = mock.call_log();
    assert_eq!(log.last().map(String::as_str), Some("close"));
    assert_eq!(session.samples().await.len(), 2);
    assert!(!session.is_polling().await);
    assert_eq!(session.activity().await, Activity::Idle);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(mock.call_log().len(), log.len());
}

#[tokio::test]
async fn operations_after_disconnect_fail() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;
    session.disconnect().await.unwrap();

    let err = assert_err!(session.read_setpoint().await);
    assert!(matches!(err, PidError::Connection { .. }));
}

#[tokio::test]
async fn reconnect_does_not_repeat_start_record() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;
    session.disconnect().await.unwrap();
    session.connect().await.unwrap();

    let starts = session
        .commands()
        .await
        .iter()
        .filter(|c| c.description == "START")
        .count();
    assert_eq!(starts, 1);
    assert_ok!(session.read_setpoint().await);
}

#[tokio::test(start_paused = true)]
async fn wait_is_logged_as_commands() {
    let mock = controller();
    let session = connected(&mock, &memory_config()).await;

    let before = tokio::time::Instant::now();
    session.wait(Duration::from_secs(30)).await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(30));

    let descriptions: Vec<String> = session
        .commands()
        .await
        .into_iter()
        .map(|c| c.description)
        .collect();
    assert_eq!(descriptions, vec!["START", "Wait for 30s", "Wait end"]);
}

#[tokio::test]
async fn logs_are_written_as_csv() {
    let dir = tempfile::tempdir().unwrap();
    let mock = controller();
    let session = connected(&mock, &disk_config(&dir)).await;

    session.sample().await.unwrap();
    let paths = session.log_paths().unwrap().clone();
    assert!(!paths.temperature.exists());

    session.sample().await.unwrap();
    session.write_setpoint(190.0).await.unwrap();

    let mut reader = csv::Reader::from_path(&paths.temperature).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[1], "Time (s)");
    assert_eq!(&headers[4], PV_HEADING);
    assert_eq!(&headers[5], SP_HEADING);
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][4], "184.3");
    assert_eq!(&rows[0][5], "180");

    let mut reader = csv::Reader::from_path(&paths.commands).unwrap();
    let commands: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[4].to_string())
        .collect();
    assert_eq!(commands, vec!["START", "Set setpoint to 190.00°C"]);
}

#[tokio::test]
async fn failed_close_still_saves_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mock = controller();
    let session = connected(&mock, &disk_config(&dir)).await;
    session.sample().await.unwrap();

    mock.fail_close(true);
    let err = session.disconnect().await.unwrap_err();
    assert!(matches!(err, PidError::Connection { .. }));

    let paths = session.log_paths().unwrap();
    let rows = csv::Reader::from_path(&paths.temperature)
        .unwrap()
        .records()
        .count();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn save_and_close_failures_are_reported_together() {
    let dir = tempfile::tempdir().unwrap();
    let mock = controller();
    let session = connected(&mock, &disk_config(&dir)).await;

    std::fs::remove_dir_all(dir.path().join("logs")).unwrap();
    session.sample().await.unwrap();
    mock.fail_close(true);

    match session.disconnect().await {
        Err(PidError::DisconnectFailed(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(matches!(errors[0], PidError::Storage { .. }));
            assert!(matches!(errors[1], PidError::Connection { .. }));
        }
        other => panic!("expected DisconnectFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_saves_of_both_logs_are_reported_together() {
    let dir = tempfile::tempdir().unwrap();
    let mock = controller();
    let session = connected(&mock, &disk_config(&dir)).await;

    std::fs::remove_dir_all(dir.path().join("logs")).unwrap();
    session.sample().await.unwrap();
    assert_err!(session.wait(Duration::ZERO).await);

    match session.save_logs().await {
        Err(PidError::SaveFailed(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .all(|e| matches!(e, PidError::Storage { .. })));
        }
        other => panic!("expected SaveFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_datetime_specifier_is_rejected_by_new() {
    let dir = tempfile::tempdir().unwrap();
    let config = PidConfig {
        datetime_format: "%Q".to_string(),
        ..disk_config(&dir)
    };

    let created = DeviceSession::new(&config, Box::new(controller()));

    assert!(matches!(created, Err(PidError::Configuration(_))));
    assert!(!dir.path().join("logs").exists());
}

#[tokio::test]
async fn dropping_session_saves_pending_samples() {
    let dir = tempfile::tempdir().unwrap();
    let mock = controller();
    let session = connected(&mock, &disk_config(&dir)).await;
    session.sample().await.unwrap();
    let paths = session.log_paths().unwrap().clone();

    drop(session);

    let rows = csv::Reader::from_path(&paths.temperature)
        .unwrap()
        .records()
        .count();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn log_paths_avoid_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = disk_config(&dir);
    let first = connected(&controller(), &config).await;
    let second = connected(&controller(), &config).await;

    let first = first.log_paths().unwrap().commands.clone();
    let second = second.log_paths().unwrap().commands.clone();
    assert_ne!(first, second);
    assert!(first.exists());
    assert!(second.exists());
}
