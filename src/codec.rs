//! Scaled register codec.
//!
//! The controller stores physical values as integers together with a
//! decimal-point setting `d`: `physical = raw / 10^d`. The decimal point is
//! mutable device state, so callers must read it immediately before every
//! conversion and never keep a [`ScaleFactor`] past a single logical read or
//! write.

use crate::error::{PidError, PidResult};

/// Largest decimal-point setting accepted from the device.
pub const MAX_DECIMALS: u32 = 4;

/// Decimal-point exponent read from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleFactor(u32);

impl ScaleFactor {
    /// Create a scale factor, rejecting exponents above [`MAX_DECIMALS`].
    pub fn new(decimals: u32) -> Option<Self> {
        (decimals <= MAX_DECIMALS).then_some(Self(decimals))
    }

    /// Decode the decimal-point register.
    ///
    /// Returns `None` for values no supported controller reports; the session
    /// turns that into a communication error.
    pub fn from_register(word: u16) -> Option<Self> {
        Self::new(u32::from(word))
    }

    /// The exponent `d`.
    pub fn decimals(self) -> u32 {
        self.0
    }

    fn divisor(self) -> f64 {
        10f64.powi(self.0 as i32)
    }

    /// `raw / 10^d`
    pub fn to_physical(self, raw: i16) -> f64 {
        f64::from(raw) / self.divisor()
    }

    /// `round(value * 10^d)`, checked against the 16-bit register range.
    pub fn to_raw(self, value: f64) -> PidResult<i16> {
        if !value.is_finite() {
            return Err(PidError::Configuration(format!(
                "cannot encode non-finite value {value}"
            )));
        }
        let scaled = (value * self.divisor()).round();
        if scaled < f64::from(i16::MIN) || scaled > f64::from(i16::MAX) {
            return Err(PidError::Configuration(format!(
                "value {value} does not fit a register with {} decimal(s)",
                self.0
            )));
        }
        Ok(scaled as i16)
    }
}

/// Reinterpret a register word as a signed value.
pub fn word_to_raw(word: u16) -> i16 {
    word as i16
}

/// Reinterpret a signed value as a register word.
pub fn raw_to_word(raw: i16) -> u16 {
    raw as u16
}

/// `raw / 10^d`
pub fn to_physical(raw: i16, scale: ScaleFactor) -> f64 {
    scale.to_physical(raw)
}

/// `round(value * 10^d)`
pub fn to_raw(value: f64, scale: ScaleFactor) -> PidResult<i16> {
    scale.to_raw(value)
}
