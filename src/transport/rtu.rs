//! Modbus RTU transport over a local serial port.
//!
//! Framing and CRC are handled by `tokio-modbus`; the serial line is opened
//! with `tokio-serial` using the controller's fixed settings (8 data bits,
//! 1 stop bit, no parity, no flow control). Every request is bounded by the
//! configured response timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info, warn};

use super::{RegisterTransport, TransportError};

/// Serial line settings for the RTU link.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Port name (e.g., "/dev/ttyUSB0", "COM5")
    pub port: String,
    /// Baud rate configured on the controller
    pub baud_rate: u32,
    /// Per-request response timeout
    pub response_timeout: Duration,
}

impl SerialSettings {
    /// Settings with the controller's default 1.5 s response timeout.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            response_timeout: Duration::from_millis(1500),
        }
    }
}

/// Modbus RTU master bound to one serial port.
pub struct RtuTransport {
    settings: SerialSettings,
    ctx: Option<Context>,
}

impl RtuTransport {
    /// Create a transport; the port is not opened until [`RegisterTransport::open`].
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            ctx: None,
        }
    }

    fn context(&mut self, device_id: u8) -> Result<&mut Context, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotOpen)?;
        ctx.set_slave(Slave(device_id));
        Ok(ctx)
    }
}

fn map_modbus_error(err: tokio_modbus::Error) -> TransportError {
    match err {
        tokio_modbus::Error::Transport(io) => TransportError::Io(io),
        other => TransportError::Malformed(other.to_string()),
    }
}

#[async_trait]
impl RegisterTransport for RtuTransport {
    fn name(&self) -> &str {
        &self.settings.port
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.ctx.is_some() {
            if let Err(e) = self.close().await {
                warn!("Ignoring error while reopening '{}': {}", self.settings.port, e);
            }
        }

        let stream = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(self.settings.response_timeout)
            .open_native_async()
            .map_err(|e| {
                TransportError::Open(format!(
                    "serial port '{}' at {} baud: {}",
                    self.settings.port, self.settings.baud_rate, e
                ))
            })?;

        self.ctx = Some(rtu::attach(stream));
        info!(
            "Serial port '{}' opened at {} baud",
            self.settings.port, self.settings.baud_rate
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.disconnect()
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Close(e.to_string()))?;
            debug!("Serial port '{}' closed", self.settings.port);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_input_registers(
        &mut self,
        device_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let limit = self.settings.response_timeout;
        let ctx = self.context(device_id)?;
        match timeout(limit, ctx.read_input_registers(address, count)).await {
            Err(_) => Err(TransportError::Timeout(limit)),
            Ok(Err(e)) => Err(map_modbus_error(e)),
            Ok(Ok(Err(code))) => Err(TransportError::Exception {
                device_id,
                exception: format!("{code:?}"),
            }),
            Ok(Ok(Ok(words))) => {
                if words.len() != count as usize {
                    return Err(TransportError::Malformed(format!(
                        "expected {} registers from {}, got {}",
                        count,
                        address,
                        words.len()
                    )));
                }
                Ok(words)
            }
        }
    }

    async fn write_multiple_registers(
        &mut self,
        device_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let limit = self.settings.response_timeout;
        let ctx = self.context(device_id)?;
        match timeout(limit, ctx.write_multiple_registers(address, values)).await {
            Err(_) => Err(TransportError::Timeout(limit)),
            Ok(Err(e)) => Err(map_modbus_error(e)),
            Ok(Ok(Err(code))) => Err(TransportError::Exception {
                device_id,
                exception: format!("{code:?}"),
            }),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }
}
