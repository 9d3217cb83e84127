//! Driver for Gefran PID temperature controllers (650 / 1250 / 1350) over
//! Modbus RTU.
//!
//! The crate reads the process value and setpoint in °C, writes new
//! setpoints, logs temperatures in the background and waits for the
//! temperature to settle around the setpoint.
//!
//! ```no_run
//! use gefran_pid::{DeviceSession, PidConfig, StabilityCriteria};
//!
//! # async fn run() -> gefran_pid::PidResult<()> {
//! let config = PidConfig::for_port("/dev/ttyUSB0");
//! let session = DeviceSession::connect_serial(&config).await?;
//!
//! session.write_setpoint(185.5).await?;
//! session.start_polling().await?;
//! let stable = session
//!     .wait_until_stable(StabilityCriteria::default().with_tolerance(1.0))
//!     .await?;
//! println!("stable: {stable}, PV = {} °C", session.read_process_value().await?);
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod polling;
pub mod session;
pub mod stability;
pub mod store;
pub mod transport;

pub use codec::{ScaleFactor, MAX_DECIMALS};
pub use config::{PidConfig, RegisterMap};
pub use error::{PidError, PidResult};
pub use session::{Activity, DeviceSession};
pub use stability::{StabilityCriteria, StabilityPredicate, StabilityWindow, WithinTolerance};
pub use store::{CommandRecord, LogPaths, Sample, SampleStore};
pub use transport::{MockTransport, RegisterTransport, TransportError};
