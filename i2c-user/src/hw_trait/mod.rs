//! Hardware abstraction layer traits.
//!
//! Drivers written against [`I2c`] work unchanged whether the bus is a
//! directly attached controller or the virtual adapter whose transfers are
//! serviced by an external agent.

pub mod i2c;

pub use i2c::{I2c, I2cError};

/// Common error type for hardware operations
#[derive(Debug, thiserror::Error)]
pub enum HwError {
    /// Transfer rejected or failed on the virtual bus
    #[error("Transfer failed: {0}")]
    Transfer(#[from] crate::error::Error),

    /// Invalid parameter or argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported by hardware
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

pub type Result<T> = std::result::Result<T, HwError>;
