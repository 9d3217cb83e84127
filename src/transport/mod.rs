//! Register transport abstraction
//!
//! The session never talks to a serial port directly. It goes through a
//! [`RegisterTransport`], which exposes the handful of Modbus primitives the
//! controller needs: open/close and reading or writing 16-bit registers on a
//! given device ID.
//!
//! - [`RtuTransport`] speaks Modbus RTU over a local serial port (feature
//!   `instrument_serial`).
//! - [`MockTransport`] is an in-memory register bank used by the test suite
//!   and for dry runs without hardware.

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod rtu;

pub use mock::MockTransport;
#[cfg(feature = "instrument_serial")]
pub use rtu::{RtuTransport, SerialSettings};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a transport implementation.
///
/// These never leave the crate's public API directly; the session wraps them
/// into [`crate::error::PidError`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),

    #[error("failed to close transport: {0}")]
    Close(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device {device_id} rejected request: {exception}")]
    Exception { device_id: u8, exception: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Low-level register access used by the device session.
///
/// Implementations do not need internal locking: the session serializes
/// every call behind its own mutex.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Human readable name of the link, used in logs.
    fn name(&self) -> &str;

    /// Open the underlying link. Opening an already open link reopens it.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the underlying link.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Read `count` input registers starting at `address`.
    async fn read_input_registers(
        &mut self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write `values` to consecutive holding registers starting at `address`.
    async fn write_multiple_registers(
        &mut self,
        device_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;
}

/// Read exactly one register, rejecting short responses.
pub(crate) async fn read_single(
    transport: &mut dyn RegisterTransport,
    device_id: u8,
    address: u16,
) -> Result<u16, TransportError> {
    let words = transport.read_input_registers(device_id, address, 1).await?;
    words.first().copied().ok_or_else(|| {
        TransportError::Malformed(format!("empty response reading register {address}"))
    })
}
