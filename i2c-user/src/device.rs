//! Device-file protocol used by the external agent.
//!
//! # Legacy stream protocol
//!
//! ```text
//! read(2)          -> [addr8] [len]           address stage
//! read(len)        -> [data...]               write message payload
//! write([data...]) -> len                     read message payload
//! ```
//!
//! Reading while a read payload is due, or writing while a write payload
//! is due, aborts the transaction. The agent uses this to report a NACK.
//!
//! # Control protocol
//!
//! | Command | Code | Argument |
//! |---|---|---|
//! | [`I2C_USER_FETCH_MSG`] | `0x80046901` | out: `[addr8] [len] [flags] [0]` |
//! | [`I2C_USER_SET_FUNC`] | `0x40046902` | in: capability mask, u32 LE |
//!
//! The control fetch carries the STOP flag, so the agent can keep the bus
//! between messages of one transaction (repeated START).

use std::sync::Arc;

use strum::FromRepr;

use crate::{
    adapter::{I2cFramework, UserBus},
    bus::{Functionality, MsgHeader, Session, State},
    error::{Error, Result},
    tracing::prelude::*,
};

/// `_IOR('i', 1, 4)`: fetch the next message header.
pub const I2C_USER_FETCH_MSG: u32 = 0x8004_6901;

/// `_IOW('i', 2, 4)`: override the capability mask.
pub const I2C_USER_SET_FUNC: u32 = 0x4004_6902;

/// Numeric control command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum ControlCode {
    FetchMessage = 0x8004_6901,
    SetFunctionality = 0x4004_6902,
}

/// Typed control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Fetch the next message header, blocking until one is available.
    FetchMessage,
    /// Replace the advertised capability mask.
    SetFunctionality(Functionality),
}

/// Result of a typed control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    Message(MsgHeader),
    Done,
}

/// An open handle on the user I2C device.
///
/// Each handle owns one session and the adapter registered for it.
/// Closing the handle (or dropping it) terminates the session and
/// unregisters the adapter.
pub struct DeviceFile {
    session: Arc<Session>,
    framework: Arc<dyn I2cFramework>,
    closed: bool,
}

impl DeviceFile {
    pub(crate) fn new(session: Arc<Session>, framework: Arc<dyn I2cFramework>) -> Self {
        Self {
            session,
            framework,
            closed: false,
        }
    }

    /// Name of the adapter registered for this handle.
    pub fn adapter_name(&self) -> &str {
        self.session.name()
    }

    /// In-process handle on the adapter, for requesters.
    pub fn bus(&self) -> UserBus {
        UserBus::new(Arc::clone(&self.session))
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Sequential read.
    ///
    /// Returns the pending write payload if one is due, otherwise blocks for
    /// the next message and returns its 2-byte header.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(n) = self.session.try_pull_payload(buf)? {
            return Ok(n);
        }

        if buf.len() < MsgHeader::LEGACY_SIZE {
            return Err(Error::Fault {
                need: MsgHeader::LEGACY_SIZE,
                have: buf.len(),
            });
        }
        let header = self.session.fetch_header().await?;
        buf[..MsgHeader::LEGACY_SIZE].copy_from_slice(&header.encode_legacy());
        Ok(MsgHeader::LEGACY_SIZE)
    }

    /// Sequential write: delivers the pending read payload. Never blocks.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.session.push_payload(buf)
    }

    /// Typed control request.
    pub async fn ioctl(&self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::FetchMessage => {
                let header = self.session.fetch_header().await?;
                Ok(ControlResponse::Message(header))
            }
            ControlRequest::SetFunctionality(mask) => {
                self.session.set_functionality(mask)?;
                Ok(ControlResponse::Done)
            }
        }
    }

    /// Control request by numeric code, with a raw argument buffer.
    ///
    /// Returns the number of bytes written to `arg`.
    pub async fn ioctl_raw(&self, cmd: u32, arg: &mut [u8]) -> Result<usize> {
        let code = ControlCode::from_repr(cmd).ok_or(Error::NoSuchOperation(cmd))?;

        // Argument size is checked before touching session state
        const ARG_SIZE: usize = 4;
        if arg.len() < ARG_SIZE {
            return Err(Error::Fault {
                need: ARG_SIZE,
                have: arg.len(),
            });
        }

        match code {
            ControlCode::FetchMessage => {
                let header = self.session.fetch_header().await?;
                arg[..MsgHeader::SIZE].copy_from_slice(&header.encode());
                Ok(MsgHeader::SIZE)
            }
            ControlCode::SetFunctionality => {
                let mask = u32::from_le_bytes([arg[0], arg[1], arg[2], arg[3]]);
                self.session
                    .set_functionality(Functionality::from_bits_retain(mask))?;
                Ok(0)
            }
        }
    }

    /// Close the handle, terminating the session.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.session.terminate();
        self.framework.del_adapter(self.session.name());
        info!(adapter = %self.session.name(), "Adapter removed");
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.release();
    }
}
