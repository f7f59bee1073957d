//! Client-side I2C trait.
//!
//! Only [`I2c::transfer`] is required. The register-style helpers are built
//! on it, so any adapter that can run a message list gets them unchanged.

use async_trait::async_trait;

use super::{HwError, Result};
use crate::bus::Message;

/// Bus conditions a bus master can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum I2cError {
    /// Target did not acknowledge its address
    #[error("No acknowledgment from device at address 0x{0:02x}")]
    NoAck(u8),

    #[error("Bus arbitration lost")]
    ArbitrationLost,

    /// Unexpected bus condition, e.g. a read with no read address selected
    #[error("Bus error")]
    BusError,
}

fn copy_read(msg: &Message, buffer: &mut [u8]) -> Result<()> {
    if msg.len() != buffer.len() {
        return Err(HwError::InvalidParameter(format!(
            "short read from 0x{:02x}: {} of {} bytes",
            msg.addr,
            msg.len(),
            buffer.len()
        )));
    }
    buffer.copy_from_slice(&msg.buf);
    Ok(())
}

#[async_trait]
pub trait I2c: Send + Sync {
    /// Run `msgs` as one combined transaction, repeated START between
    /// messages. Returns the number of messages completed.
    async fn transfer(&mut self, msgs: &mut [Message]) -> Result<usize>;

    async fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        let mut msgs = [Message::write(addr, data)];
        self.transfer(&mut msgs).await?;
        Ok(())
    }

    async fn read(&mut self, addr: u8, buffer: &mut [u8]) -> Result<()> {
        let mut msgs = [Message::read(addr, buffer.len())];
        self.transfer(&mut msgs).await?;
        copy_read(&msgs[0], buffer)
    }

    /// Write then read with a repeated START, the usual register read.
    async fn write_read(&mut self, addr: u8, write: &[u8], read: &mut [u8]) -> Result<()> {
        let mut msgs = [Message::write(addr, write), Message::read(addr, read.len())];
        self.transfer(&mut msgs).await?;
        copy_read(&msgs[1], read)
    }

    /// Set the bus clock. Adapters without control over timing refuse.
    async fn set_frequency(&mut self, hz: u32) -> Result<()> {
        Err(HwError::NotSupported(format!(
            "cannot set bus clock to {} Hz",
            hz
        )))
    }
}
