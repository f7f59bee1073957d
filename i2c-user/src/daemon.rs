//! Daemon lifecycle management for i2c-userd.
//!
//! Opens the user I2C device, runs the agent that services it on a
//! simulated bus, and probes the resulting adapter periodically the way a
//! bus client would. Runs until SIGINT or SIGTERM.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    adapter::{BusRegistry, I2cAlgorithm, UserI2cDevice},
    agent::{Agent, AgentStats, BusMaster, SimulatedBus},
    bus::Message,
    config::Config,
    error::{Error, Result},
};

/// 7-bit addresses outside the reserved ranges.
const PROBE_ADDRS: std::ops::RangeInclusive<u8> = 0x08..=0x77;

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let registry = Arc::new(BusRegistry::new(self.config.max_adapters));
        let device = UserI2cDevice::new(registry.clone(), self.config.device.clone());
        let file = Arc::new(device.open()?);
        let adapter_name = file.adapter_name().to_string();

        let mut bus = SimulatedBus::new().without_transcript();
        for addr in &self.config.sim_devices {
            bus.add_target(*addr);
        }
        info!(
            adapter = %adapter_name,
            targets = ?bus.targets(),
            "Simulated bus ready"
        );

        // The agent task owns the device file; the session closes when it exits
        let agent = Agent::new(file, bus, self.config.protocol);
        let agent_handle = self
            .tracker
            .spawn(agent_task(agent, self.shutdown.clone()));

        match registry.get(&adapter_name) {
            Some(adapter) => {
                self.tracker.spawn(probe_task(
                    adapter,
                    self.config.scan_interval,
                    self.shutdown.clone(),
                ));
            }
            None => error!(adapter = %adapter_name, "Adapter missing from registry"),
        }

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=i2c_user=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
            _ = self.shutdown.cancelled() => {
                warn!("Agent exited, shutting down.");
            },
        }

        self.shutdown.cancel();
        self.tracker.wait().await;

        if !registry.is_empty() {
            warn!(adapters = ?registry.names(), "Adapters still registered at exit");
        }

        let stats = agent_handle.await?.context("agent failed")?;
        info!(messages = stats.messages, nacks = stats.nacks, "Exiting.");

        Ok(())
    }
}

/// Run the agent. A failure cancels `shutdown` so the daemon stops with it.
async fn agent_task<B: BusMaster>(
    mut agent: Agent<B>,
    shutdown: CancellationToken,
) -> Result<AgentStats> {
    let result = agent.run(shutdown.clone()).await;
    if let Err(e) = &result {
        error!("Agent error: {}", e);
        shutdown.cancel();
    }
    result
}

/// Addresses on `adapter` that acknowledge a zero-length write.
pub async fn scan(adapter: &dyn I2cAlgorithm) -> Result<Vec<u8>> {
    let mut found = Vec::new();
    for addr in PROBE_ADDRS {
        let mut msgs = [Message::write(addr, Vec::new())];
        match adapter.master_xfer(&mut msgs).await {
            Ok(_) => found.push(addr),
            Err(Error::Aborted { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(found)
}

async fn probe_task(
    adapter: Arc<dyn I2cAlgorithm>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = scan(adapter.as_ref()) => result,
        };
        match result {
            Ok(found) => {
                if last.as_ref() != Some(&found) {
                    let addrs: Vec<_> = found.iter().map(|a| format!("{:#04x}", a)).collect();
                    info!(devices = ?addrs, "Bus scan changed");
                } else {
                    debug!(count = found.len(), "Bus scan unchanged");
                }
                last = Some(found);
            }
            Err(e) if e.is_fatal() => {
                debug!("Bus gone, probe stopping");
                break;
            }
            Err(e) => warn!(error = %e, "Bus scan failed"),
        }
    }
}
