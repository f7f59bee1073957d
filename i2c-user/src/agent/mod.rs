//! External agent: services the virtual bus on a physical (or simulated)
//! bus master.
//!
//! The agent loops over the device file: fetch a message header, drive the
//! bus master through the address stage, then move the payload between the
//! bus and the session. A target that does not acknowledge its address is
//! reported by issuing the payload operation of the opposite direction,
//! which aborts the transaction.

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{MsgHeader, MAX_MSG_LEN},
    config::ProtocolMode,
    device::{DeviceFile, I2C_USER_FETCH_MSG},
    error::{Error, Result},
    hw_trait::I2cError,
    tracing::prelude::*,
};

pub use sim::{BusEvent, SimulatedBus};

/// Acknowledge bit sampled after a byte is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Nack,
}

/// Byte-level bus master the agent drives.
#[async_trait]
pub trait BusMaster: Send {
    /// Issue a START (or repeated START).
    async fn start(&mut self) -> std::result::Result<(), I2cError>;

    /// Clock out `data`, stopping at the first byte that is not
    /// acknowledged. Returns the acknowledge of the last byte sent.
    async fn write(&mut self, data: &[u8]) -> std::result::Result<Ack, I2cError>;

    /// Clock in `buf.len()` bytes, acknowledging all but the last.
    async fn read(&mut self, buf: &mut [u8]) -> std::result::Result<(), I2cError>;

    /// Issue a STOP.
    async fn stop(&mut self) -> std::result::Result<(), I2cError>;
}

/// Counters reported when the agent exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    /// Messages serviced to completion.
    pub messages: u64,
    /// Messages aborted because the address was not acknowledged.
    pub nacks: u64,
}

pub struct Agent<B> {
    file: Arc<DeviceFile>,
    bus: B,
    mode: ProtocolMode,
    stats: AgentStats,
    buf: [u8; MAX_MSG_LEN + 1],
}

impl<B: BusMaster> Agent<B> {
    pub fn new(file: Arc<DeviceFile>, bus: B, mode: ProtocolMode) -> Self {
        Self {
            file,
            bus,
            mode,
            stats: AgentStats::default(),
            buf: [0; MAX_MSG_LEN + 1],
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    /// Service messages until the session terminates or `shutdown` fires.
    ///
    /// Bus failures other than a missing acknowledge end the loop with an
    /// error. Session errors on a single message are logged and the loop
    /// moves on to the next header.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<AgentStats> {
        info!(adapter = %self.file.adapter_name(), mode = ?self.mode, "Agent started");

        loop {
            let header = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                header = self.next_header() => header,
            };

            let result = match header {
                Ok(header) => self.service(header).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(Error::Terminated) => {
                    debug!(adapter = %self.file.adapter_name(), "Session terminated");
                    break;
                }
                Err(Error::Bus(e)) => {
                    error!(adapter = %self.file.adapter_name(), error = %e, "Bus failure");
                    return Err(Error::Bus(e));
                }
                Err(e) => {
                    warn!(adapter = %self.file.adapter_name(), error = %e, "Message not serviced");
                }
            }
        }

        info!(
            adapter = %self.file.adapter_name(),
            messages = self.stats.messages,
            nacks = self.stats.nacks,
            "Agent stopped"
        );
        Ok(self.stats)
    }

    async fn next_header(&mut self) -> Result<MsgHeader> {
        match self.mode {
            ProtocolMode::Legacy => {
                let buf = &mut self.buf[..MsgHeader::LEGACY_SIZE];
                let n = self.file.read(buf).await?;
                MsgHeader::parse_legacy(&buf[..n])
            }
            ProtocolMode::Structured => {
                let buf = &mut self.buf[..MsgHeader::SIZE];
                let n = self.file.ioctl_raw(I2C_USER_FETCH_MSG, buf).await?;
                MsgHeader::parse(&buf[..n])
            }
        }
    }

    async fn service(&mut self, header: MsgHeader) -> Result<()> {
        let len = usize::from(header.len);
        // Legacy headers carry no STOP flag; parse_legacy sets it
        let stop = header.stop;

        self.bus.start().await?;
        if self.bus.write(&[header.addr8]).await? == Ack::Nack {
            debug!(
                addr = %format!("{:#04x}", header.addr()),
                read = header.is_read(),
                "Address not acknowledged"
            );
            self.stats.nacks += 1;
            self.bus.stop().await?;
            return self.report_nack(header).await;
        }

        if header.is_read() {
            let data = &mut self.buf[..len];
            self.bus.read(data).await?;
            self.file.write(data).await?;
        } else {
            let n = self.file.read(&mut self.buf[..len]).await?;
            if self.bus.write(&self.buf[..n]).await? == Ack::Nack {
                // Payload NACK still completes the message
                debug!(addr = %format!("{:#04x}", header.addr()), "Data not acknowledged");
            }
        }

        if stop {
            self.bus.stop().await?;
        }
        self.stats.messages += 1;
        Ok(())
    }

    // The opposite-direction payload operation is the only way to fail a
    // message, and is expected to return Io.
    async fn report_nack(&mut self, header: MsgHeader) -> Result<()> {
        let outcome = if header.is_read() {
            self.file.read(&mut self.buf[..1]).await
        } else {
            self.file.write(&self.buf[..1]).await
        };
        match outcome {
            Err(Error::Io) => Ok(()),
            Err(e) => Err(e),
            Ok(_) => Err(Error::Other("session accepted payload for NACKed message".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::{BusRegistry, I2cAlgorithm, UserBus, UserI2cDevice},
        bus::{Message, State},
        config::DeviceConfig,
        hw_trait::{HwError, I2c},
    };
    use tokio::task::JoinHandle;

    type AgentTask = JoinHandle<(Agent<SimulatedBus>, Result<AgentStats>)>;

    fn setup(mode: ProtocolMode, bus: SimulatedBus) -> (UserBus, CancellationToken, AgentTask) {
        let registry = Arc::new(BusRegistry::new(4));
        let device = UserI2cDevice::new(registry, DeviceConfig::default());
        let file = Arc::new(device.open().unwrap());
        let user_bus = file.bus();

        let shutdown = CancellationToken::new();
        let mut agent = Agent::new(file, bus, mode);
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let result = agent.run(shutdown).await;
                (agent, result)
            }
        });
        (user_bus, shutdown, task)
    }

    fn eeprom() -> SimulatedBus {
        let mut bus = SimulatedBus::new();
        bus.add_target(0x50);
        bus.poke(0x50, 0x10, &[0xde, 0xad, 0xbe, 0xef]);
        bus
    }

    async fn finish(shutdown: CancellationToken, task: AgentTask) -> (SimulatedBus, AgentStats) {
        shutdown.cancel();
        let (agent, result) = task.await.unwrap();
        (agent.into_bus(), result.unwrap())
    }

    #[tokio::test]
    async fn test_structured_write_read_uses_repeated_start() {
        let (mut user_bus, shutdown, task) = setup(ProtocolMode::Structured, eeprom());

        let mut data = [0u8; 2];
        user_bus.write_read(0x50, &[0x10], &mut data).await.unwrap();
        assert_eq!(data, [0xde, 0xad]);

        let (bus, stats) = finish(shutdown, task).await;
        assert_eq!(
            bus.events(),
            &[
                BusEvent::Start,
                BusEvent::Address { addr8: 0xa0, ack: Ack::Ack },
                BusEvent::Write(vec![0x10]),
                BusEvent::Start,
                BusEvent::Address { addr8: 0xa1, ack: Ack::Ack },
                BusEvent::Read(vec![0xde, 0xad]),
                BusEvent::Stop,
            ]
        );
        assert_eq!(stats, AgentStats { messages: 2, nacks: 0 });
    }

    #[tokio::test]
    async fn test_legacy_mode_stops_after_every_message() {
        let (mut user_bus, shutdown, task) = setup(ProtocolMode::Legacy, eeprom());

        let mut data = [0u8; 1];
        user_bus.write_read(0x50, &[0x12], &mut data).await.unwrap();
        assert_eq!(data, [0xbe]);

        let (bus, _) = finish(shutdown, task).await;
        let stops = bus
            .events()
            .iter()
            .filter(|e| **e == BusEvent::Stop)
            .count();
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn test_write_updates_target_registers() {
        let (mut user_bus, shutdown, task) = setup(ProtocolMode::Structured, eeprom());

        user_bus.write(0x50, &[0x20, 0x01, 0x02, 0x03]).await.unwrap();
        let mut data = [0u8; 3];
        user_bus.read(0x50, &mut data).await.unwrap();
        // Register pointer auto-increments past the written bytes
        assert_eq!(data, [0x00, 0x00, 0x00]);

        let (bus, _) = finish(shutdown, task).await;
        assert_eq!(bus.peek(0x50, 0x20, 3), Some(vec![0x01, 0x02, 0x03]));
    }

    #[tokio::test]
    async fn test_absent_address_aborts_transfer() {
        let (user_bus, shutdown, task) = setup(ProtocolMode::Structured, eeprom());

        let mut msgs = [Message::read(0x33, 1)];
        assert!(matches!(
            user_bus.master_xfer(&mut msgs).await,
            Err(Error::Aborted { completed: 0 })
        ));

        // Bus is usable for the next transfer
        let mut msgs = [Message::write(0x50, vec![0x10]), Message::read(0x50, 1)];
        assert_eq!(user_bus.master_xfer(&mut msgs).await.unwrap(), 2);
        assert_eq!(msgs[1].buf, vec![0xde]);

        let (bus, stats) = finish(shutdown, task).await;
        assert_eq!(
            &bus.events()[..3],
            &[
                BusEvent::Start,
                BusEvent::Address { addr8: 0x67, ack: Ack::Nack },
                BusEvent::Stop,
            ]
        );
        assert_eq!(stats, AgentStats { messages: 2, nacks: 1 });
    }

    #[tokio::test]
    async fn test_nack_on_second_message_reports_progress() {
        let (mut user_bus, shutdown, task) = setup(ProtocolMode::Legacy, eeprom());

        let mut msgs = [Message::write(0x50, vec![0x10]), Message::write(0x51, vec![0x00])];
        assert!(matches!(
            user_bus.master_xfer(&mut msgs).await,
            Err(Error::Aborted { completed: 1 })
        ));
        assert!(matches!(
            user_bus.write(0x51, &[0x00]).await,
            Err(HwError::Transfer(Error::Aborted { completed: 0 }))
        ));

        let (_, stats) = finish(shutdown, task).await;
        assert_eq!(stats.nacks, 2);
    }

    #[tokio::test]
    async fn test_bus_fault_ends_agent_and_releases_requester() {
        let mut bus = eeprom();
        bus.inject_fault(I2cError::ArbitrationLost);
        let (user_bus, _shutdown, task) = setup(ProtocolMode::Structured, bus);

        let requester = tokio::spawn(async move {
            let mut msgs = [Message::read(0x50, 1)];
            let result = user_bus.master_xfer(&mut msgs).await;
            (user_bus, result)
        });

        let (agent, result) = task.await.unwrap();
        assert!(matches!(result, Err(Error::Bus(I2cError::ArbitrationLost))));
        // Dropping the agent closes the device file
        drop(agent);

        let (_, result) = requester.await.unwrap();
        assert!(matches!(result, Err(Error::Terminated)));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_leaves_session_idle() {
        let registry = Arc::new(BusRegistry::new(4));
        let device = UserI2cDevice::new(registry, DeviceConfig::default());
        let file = Arc::new(device.open().unwrap());

        let shutdown = CancellationToken::new();
        let mut agent = Agent::new(Arc::clone(&file), SimulatedBus::new(), ProtocolMode::Structured);
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { agent.run(shutdown).await }
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while file.state() != State::W4NextRequest {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        assert_eq!(task.await.unwrap().unwrap(), AgentStats::default());
        assert_eq!(file.state(), State::Idle);
    }
}
