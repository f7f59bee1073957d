//! In-memory bus master with register-file targets.
//!
//! Each target behaves like a 24Cxx EEPROM or a sensor register map: the
//! first byte written after the address sets the register pointer, further
//! written bytes are stored at the pointer, and reads return bytes from the
//! pointer. The pointer auto-increments and wraps at 256. Addresses without
//! a target are not acknowledged.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Ack, BusMaster};
use crate::hw_trait::I2cError;

/// One bus condition, as recorded in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Start,
    Address { addr8: u8, ack: Ack },
    Write(Vec<u8>),
    Read(Vec<u8>),
    Stop,
}

struct Target {
    regs: [u8; 256],
    pointer: u8,
}

impl Target {
    fn new() -> Self {
        Self {
            regs: [0; 256],
            pointer: 0,
        }
    }

    fn next(&mut self) -> &mut u8 {
        let reg = &mut self.regs[usize::from(self.pointer)];
        self.pointer = self.pointer.wrapping_add(1);
        reg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Address,
    Write { addr: u8, pointer_set: bool },
    Read { addr: u8 },
    NotSelected,
}

pub struct SimulatedBus {
    targets: BTreeMap<u8, Target>,
    phase: Phase,
    fault: Option<I2cError>,
    events: Vec<BusEvent>,
    transcript: bool,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            phase: Phase::Idle,
            fault: None,
            events: Vec::new(),
            transcript: true,
        }
    }

    /// Stop recording bus events, for long-running use.
    pub fn without_transcript(mut self) -> Self {
        self.transcript = false;
        self.events = Vec::new();
        self
    }

    /// Populate a target at 7-bit address `addr`.
    pub fn add_target(&mut self, addr: u8) {
        self.targets.entry(addr).or_insert_with(Target::new);
    }

    /// Addresses that acknowledge.
    pub fn targets(&self) -> Vec<u8> {
        self.targets.keys().copied().collect()
    }

    /// Store `data` in a target's registers starting at `reg`.
    pub fn poke(&mut self, addr: u8, reg: u8, data: &[u8]) {
        if let Some(target) = self.targets.get_mut(&addr) {
            for (i, byte) in data.iter().enumerate() {
                target.regs[usize::from(reg.wrapping_add(i as u8))] = *byte;
            }
        }
    }

    /// Registers of a target, or `None` if there is none at `addr`.
    pub fn peek(&self, addr: u8, reg: u8, len: usize) -> Option<Vec<u8>> {
        self.targets.get(&addr).map(|target| {
            (0..len)
                .map(|i| target.regs[usize::from(reg.wrapping_add(i as u8))])
                .collect()
        })
    }

    /// Fail the next bus operation with `error`.
    pub fn inject_fault(&mut self, error: I2cError) {
        self.fault = Some(error);
    }

    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    fn record(&mut self, event: BusEvent) {
        if self.transcript {
            self.events.push(event);
        }
    }

    fn check_fault(&mut self) -> Result<(), I2cError> {
        match self.fault.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn select(&mut self, addr8: u8) -> Ack {
        let addr = addr8 >> 1;
        let ack = if self.targets.contains_key(&addr) {
            Ack::Ack
        } else {
            Ack::Nack
        };
        self.phase = match (ack, addr8 & 0x01 != 0) {
            (Ack::Nack, _) => Phase::NotSelected,
            (Ack::Ack, true) => Phase::Read { addr },
            (Ack::Ack, false) => Phase::Write {
                addr,
                pointer_set: false,
            },
        };
        self.record(BusEvent::Address { addr8, ack });
        ack
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusMaster for SimulatedBus {
    async fn start(&mut self) -> Result<(), I2cError> {
        self.check_fault()?;
        self.phase = Phase::Address;
        self.record(BusEvent::Start);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<Ack, I2cError> {
        self.check_fault()?;

        let data = match self.phase {
            Phase::Address => {
                let Some((addr8, rest)) = data.split_first() else {
                    return Ok(Ack::Ack);
                };
                let ack = self.select(*addr8);
                if ack == Ack::Nack || rest.is_empty() {
                    return Ok(ack);
                }
                rest
            }
            _ => data,
        };
        if data.is_empty() {
            return Ok(Ack::Ack);
        }

        let Phase::Write { addr, mut pointer_set } = self.phase else {
            return Err(I2cError::BusError);
        };
        let Some(target) = self.targets.get_mut(&addr) else {
            return Ok(Ack::Nack);
        };
        for byte in data {
            if pointer_set {
                *target.next() = *byte;
            } else {
                target.pointer = *byte;
                pointer_set = true;
            }
        }
        self.phase = Phase::Write { addr, pointer_set };
        self.record(BusEvent::Write(data.to_vec()));
        Ok(Ack::Ack)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<(), I2cError> {
        self.check_fault()?;

        let Phase::Read { addr } = self.phase else {
            return Err(I2cError::BusError);
        };
        let target = self
            .targets
            .get_mut(&addr)
            .ok_or(I2cError::NoAck(addr))?;
        for byte in buf.iter_mut() {
            *byte = *target.next();
        }
        self.record(BusEvent::Read(buf.to_vec()));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), I2cError> {
        self.check_fault()?;
        self.phase = Phase::Idle;
        self.record(BusEvent::Stop);
        Ok(())
    }
}
