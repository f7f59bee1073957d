//! Virtual I2C bus adapter whose transfers are serviced by an external agent.
//!
//! Opening the [`adapter::UserI2cDevice`] registers a bus adapter. Transfers
//! issued against that adapter are handed, one message at a time, to the
//! agent holding the [`device::DeviceFile`], which performs them on real (or
//! simulated) hardware and reports the results back.

pub mod adapter;
pub mod agent;
pub mod bus;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod hw_trait;
pub mod tracing;
