//! Error types for hardware access.

use thiserror::Error;

/// Errors that can occur while talking to the vehicle's peripherals.
#[derive(Debug, Error)]
pub enum HalError {
    /// I²C bus access failed.
    #[error("I2C error on {context}: {source}")]
    I2c {
        /// What was being attempted.
        context: String,
        /// Source I/O error.
        source: std::io::Error,
    },

    /// A device responded with an unexpected identity.
    #[error("unexpected device id {found:#04x} at address {address:#04x}")]
    UnknownDevice {
        /// Probed I²C address.
        address: u8,
        /// WHO_AM_I value read back.
        found: u8,
    },

    /// The PWM peripheral rejected the requested setup.
    #[error("PWM setup invalid: {0}")]
    PwmSetup(String),

    /// A simulated device was told to fail (tests only).
    #[error("simulated device failure")]
    Simulated,

    /// Requested option is not in the device's supported set.
    #[error("unsupported {what}: {value}")]
    Unsupported {
        /// Option kind, e.g. "gyro range".
        what: &'static str,
        /// Offending value.
        value: u32,
    },
}

/// Result alias for HAL operations.
pub type HalResult<T> = Result<T, HalError>;

impl HalError {
    /// Wrap an I/O error with bus context.
    pub fn i2c(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::I2c { context: context.into(), source }
    }
}
