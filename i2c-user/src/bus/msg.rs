//! I2C messages, the transaction record built from them, and the message
//! header handed to the external agent.
//!
//! # Header formats
//!
//! ```text
//! Legacy (read):         [addr8] [len]
//! Structured (control):  [addr8] [len] [flags] [reserved]
//! ```
//!
//! `addr8` is the 7-bit address shifted left with the direction bit in
//! bit 0 (1 = read). In the structured record, bit 0 of `flags` is set when
//! a STOP follows the message.

use bitflags::bitflags;
use bytes::BufMut;

use crate::error::{Error, Result};

/// Largest message payload the one-byte length field can describe.
pub const MAX_MSG_LEN: usize = u8::MAX as usize;

/// Largest 7-bit address.
pub const MAX_ADDR: u8 = 0x7f;

bitflags! {
    /// Per-message flags, using the kernel's `I2C_M_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u16 {
        /// Data flows from the target to the host.
        const RD = 0x0001;
        /// A STOP condition follows this message.
        const STOP = 0x8000;
    }
}

/// One direction-specific phase of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// 7-bit target address.
    pub addr: u8,
    pub flags: MsgFlags,
    /// Payload; its length is the message length.
    pub buf: Vec<u8>,
}

impl Message {
    /// Message writing `data` to `addr`.
    pub fn write(addr: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            addr,
            flags: MsgFlags::empty(),
            buf: data.into(),
        }
    }

    /// Message reading `len` bytes from `addr`.
    pub fn read(addr: u8, len: usize) -> Self {
        Self {
            addr,
            flags: MsgFlags::RD,
            buf: vec![0; len],
        }
    }

    /// Request a STOP after this message.
    pub fn with_stop(mut self) -> Self {
        self.flags |= MsgFlags::STOP;
        self
    }

    pub fn is_read(&self) -> bool {
        self.flags.contains(MsgFlags::RD)
    }

    pub fn stop(&self) -> bool {
        self.flags.contains(MsgFlags::STOP)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Address with the direction bit, as sent on the wire.
    pub fn addr8(&self) -> u8 {
        (self.addr << 1) | u8::from(self.is_read())
    }

    fn validate(&self) -> Result<()> {
        if self.addr > MAX_ADDR {
            return Err(Error::InvalidInput(format!(
                "address 0x{:02x} is not a 7-bit address",
                self.addr
            )));
        }
        if self.buf.len() > MAX_MSG_LEN {
            return Err(Error::InvalidInput(format!(
                "message to 0x{:02x} is {} bytes, limit is {}",
                self.addr,
                self.buf.len(),
                MAX_MSG_LEN
            )));
        }
        Ok(())
    }
}

/// Header of the message currently offered to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Address with direction bit.
    pub addr8: u8,
    pub len: u8,
    /// A STOP follows this message. Always true in legacy headers.
    pub stop: bool,
}

impl MsgHeader {
    /// Encoded size of the legacy read header.
    pub const LEGACY_SIZE: usize = 2;
    /// Encoded size of the structured control record.
    pub const SIZE: usize = 4;

    const FLAG_STOP: u8 = 0x01;

    fn of(msg: &Message) -> Self {
        Self {
            addr8: msg.addr8(),
            // validated on transaction start
            len: msg.len() as u8,
            stop: msg.stop(),
        }
    }

    /// 7-bit address.
    pub fn addr(&self) -> u8 {
        self.addr8 >> 1
    }

    pub fn is_read(&self) -> bool {
        self.addr8 & 0x01 != 0
    }

    pub fn encode_legacy(&self) -> [u8; Self::LEGACY_SIZE] {
        [self.addr8, self.len]
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.addr8);
        buf.put_u8(self.len);
        buf.put_u8(if self.stop { Self::FLAG_STOP } else { 0 });
        // reserved
        buf.put_u8(0);
        out
    }

    pub fn parse_legacy(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [addr8, len, ..] => Ok(Self {
                addr8: *addr8,
                len: *len,
                stop: true,
            }),
            _ => Err(Error::Fault {
                need: Self::LEGACY_SIZE,
                have: bytes.len(),
            }),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [addr8, len, flags, _reserved, ..] => Ok(Self {
                addr8: *addr8,
                len: *len,
                stop: flags & Self::FLAG_STOP != 0,
            }),
            _ => Err(Error::Fault {
                need: Self::SIZE,
                have: bytes.len(),
            }),
        }
    }
}

/// The engine's working copy of one transfer.
///
/// The copy carries the forced STOP on the final message; the requester's
/// own messages are only written back once the transfer settles.
#[derive(Debug, Clone)]
pub struct Transaction {
    msgs: Vec<Message>,
    cursor: usize,
    handed_off: bool,
}

impl Transaction {
    pub fn new(msgs: &[Message]) -> Result<Self> {
        if msgs.is_empty() {
            return Err(Error::InvalidInput("transfer has no messages".into()));
        }
        for msg in msgs {
            msg.validate()?;
        }

        let mut msgs = msgs.to_vec();
        if let Some(last) = msgs.last_mut() {
            last.flags |= MsgFlags::STOP;
        }

        Ok(Self {
            msgs,
            cursor: 0,
            handed_off: false,
        })
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Index of the message being serviced; equals the number completed.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn messages(&self) -> &[Message] {
        &self.msgs
    }

    pub fn current(&self) -> Option<&Message> {
        self.msgs.get(self.cursor)
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut Message> {
        self.msgs.get_mut(self.cursor)
    }

    /// Header of the current message, if any remain.
    pub fn header(&self) -> Option<MsgHeader> {
        self.current().map(MsgHeader::of)
    }

    /// Whether the agent has observed any header of this transaction.
    pub fn handed_off(&self) -> bool {
        self.handed_off
    }

    pub(crate) fn mark_handed_off(&mut self) {
        self.handed_off = true;
    }

    /// Finish the current message. Returns true if more remain.
    pub(crate) fn advance(&mut self) -> bool {
        self.cursor = (self.cursor + 1).min(self.msgs.len());
        self.cursor < self.msgs.len()
    }

    /// Copy completed messages' payloads back to the requester.
    ///
    /// Only buffers are written; the requester's flags stay as supplied.
    pub(crate) fn write_back(self, dst: &mut [Message]) {
        let completed = self.cursor;
        for (dst, src) in dst.iter_mut().zip(self.msgs).take(completed) {
            dst.buf = src.buf;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1; "single")]
    #[test_case(2; "pair")]
    #[test_case(5; "several")]
    fn test_last_message_forced_stop(n: usize) {
        let msgs: Vec<_> = (0..n).map(|i| Message::write(0x50, vec![i as u8])).collect();
        let txn = Transaction::new(&msgs).unwrap();

        let stops: Vec<_> = txn.messages().iter().map(Message::stop).collect();
        assert!(stops[n - 1]);
        assert!(stops[..n - 1].iter().all(|s| !s));

        // Caller's flags untouched
        assert!(msgs.iter().all(|m| !m.stop()));
    }

    #[test]
    fn test_explicit_stop_on_earlier_message_preserved() {
        let msgs = vec![
            Message::write(0x50, vec![0x00]).with_stop(),
            Message::read(0x50, 1),
        ];
        let txn = Transaction::new(&msgs).unwrap();
        assert!(txn.messages()[0].stop());
        assert!(txn.messages()[1].stop());
    }

    #[test]
    fn test_empty_transaction_rejected() {
        assert!(matches!(
            Transaction::new(&[]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msgs = vec![Message::write(0x50, vec![0; MAX_MSG_LEN + 1])];
        assert!(matches!(
            Transaction::new(&msgs),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_ten_bit_address_rejected() {
        let msgs = vec![Message::read(0x80, 1)];
        assert!(matches!(
            Transaction::new(&msgs),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_addr8_encodes_direction() {
        assert_eq!(Message::write(0x50, vec![0x10, 0x20]).addr8(), 0xa0);
        assert_eq!(Message::read(0x50, 1).addr8(), 0xa1);
    }

    #[test]
    fn test_header_encoding() {
        let txn = Transaction::new(&[Message::read(0x50, 3)]).unwrap();
        let header = txn.header().unwrap();

        assert_eq!(header.encode_legacy(), [0xa1, 0x03]);
        assert_eq!(header.encode(), [0xa1, 0x03, 0x01, 0x00]);
        assert_eq!(MsgHeader::parse(&header.encode()).unwrap(), header);
        assert_eq!(header.addr(), 0x50);
        assert!(header.is_read());
    }

    #[test]
    fn test_short_header_is_fault() {
        assert!(matches!(
            MsgHeader::parse_legacy(&[0xa0]),
            Err(Error::Fault { need: 2, have: 1 })
        ));
        assert!(matches!(
            MsgHeader::parse(&[0xa0, 0x01]),
            Err(Error::Fault { need: 4, have: 2 })
        ));
    }

    #[test]
    fn test_write_back_only_completed_messages() {
        let mut msgs = vec![Message::read(0x50, 1), Message::read(0x51, 1)];
        let mut txn = Transaction::new(&msgs).unwrap();

        txn.current_mut().unwrap().buf[0] = 0x42;
        assert!(txn.advance());
        txn.current_mut().unwrap().buf[0] = 0x99;

        txn.write_back(&mut msgs);
        assert_eq!(msgs[0].buf, vec![0x42]);
        assert_eq!(msgs[1].buf, vec![0x00]);
    }
}
