//! Error types shared by the handoff engine, the device-file handlers and
//! adapter registration.

use crate::hw_trait::I2cError;

/// Errors surfaced to requesters and to the external agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation invoked in a state that does not permit it.
    #[error("I/O error: operation not valid in the current bus state")]
    Io,

    /// The agent aborted the transaction after `completed` messages.
    #[error("Transfer aborted after {completed} completed message(s)")]
    Aborted { completed: usize },

    /// A copy between the agent and a message buffer came up short.
    #[error("Bad address: argument buffer too small ({have} bytes, need {need})")]
    Fault { need: usize, have: usize },

    /// A blocked wait was cancelled before it completed.
    #[error("Interrupted")]
    Interrupted,

    /// The session was closed; no further transactions are possible.
    #[error("Session terminated")]
    Terminated,

    /// Request conflicts with a transaction in flight.
    #[error("Device busy")]
    Busy,

    /// Unrecognized control request code.
    #[error("No such control operation: {0:#010x}")]
    NoSuchOperation(u32),

    /// Malformed transfer or argument.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The I2C framework rejected the adapter.
    #[error("Adapter registration failed: {0}")]
    Registration(String),

    /// Bus-level failure reported by the agent's bus master.
    #[error(transparent)]
    Bus(#[from] I2cError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Negative errno equivalent, as a character device would return it.
    pub fn errno(&self) -> i32 {
        const EINTR: i32 = 4;
        const EIO: i32 = 5;
        const EFAULT: i32 = 14;
        const EBUSY: i32 = 16;
        const ENODEV: i32 = 19;
        const EINVAL: i32 = 22;
        const ENOTTY: i32 = 25;

        -match self {
            Error::Io | Error::Aborted { .. } | Error::Terminated | Error::Bus(_) => EIO,
            Error::Fault { .. } => EFAULT,
            Error::Interrupted => EINTR,
            Error::Busy => EBUSY,
            Error::NoSuchOperation(_) => ENOTTY,
            Error::InvalidInput(_) => EINVAL,
            Error::Registration(_) | Error::Other(_) => ENODEV,
        }
    }

    /// True for failures after which the session cannot be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Terminated)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
