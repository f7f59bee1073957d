//! Configuration.
//!
//! Parsed from environment variables, like the rest of the daemon's knobs.

use std::{env, time::Duration};

use crate::{bus::Functionality, tracing::prelude::*};

/// Per-device settings applied to every adapter it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Adapter name prefix; adapters are named `"<prefix> (#n)"`.
    pub name_prefix: String,
    /// Capability mask advertised until the agent overrides it.
    pub functionality: Functionality,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_prefix: "i2c-user".to_string(),
            functionality: Functionality::default(),
        }
    }
}

/// How the agent fetches message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolMode {
    /// 2-byte header from a sequential read; STOP after every message.
    Legacy,
    /// 4-byte record from the control operation; honours repeated START.
    #[default]
    Structured,
}

impl std::str::FromStr for ProtocolMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "structured" => Ok(Self::Structured),
            other => Err(format!("unknown protocol mode: {}", other)),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceConfig,
    /// Registry capacity.
    pub max_adapters: usize,
    pub protocol: ProtocolMode,
    /// Target addresses populated on the simulated bus.
    pub sim_devices: Vec<u8>,
    /// Period of the bus probe.
    pub scan_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            max_adapters: 16,
            protocol: ProtocolMode::default(),
            sim_devices: vec![0x50],
            scan_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// Unset or unparsable values fall back to the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `I2C_USER_NAME`: Adapter name prefix (default: `i2c-user`)
    /// - `I2C_USER_FUNC`: Capability mask, hex (`0x...`) or decimal
    /// - `I2C_USER_MAX_ADAPTERS`: Registry capacity (default: 16, minimum 1)
    /// - `I2C_USER_PROTOCOL`: `legacy` or `structured` (default: `structured`)
    /// - `I2C_USER_SIM_DEVICES`: Comma-separated hex target addresses (default: `0x50`)
    /// - `I2C_USER_SCAN_SECS`: Probe period in seconds (default: 10, minimum 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name_prefix = env::var("I2C_USER_NAME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.device.name_prefix);

        let functionality = env::var("I2C_USER_FUNC")
            .ok()
            .and_then(|s| parse_u32(&s))
            .map(Functionality::from_bits_retain)
            .unwrap_or(defaults.device.functionality);

        let max_adapters = env::var("I2C_USER_MAX_ADAPTERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_adapters)
            .max(1);

        let protocol = match env::var("I2C_USER_PROTOCOL") {
            Ok(s) => s.parse().unwrap_or_else(|e| {
                warn!("{}, using {:?}", e, defaults.protocol);
                defaults.protocol
            }),
            Err(_) => defaults.protocol,
        };

        let sim_devices = env::var("I2C_USER_SIM_DEVICES")
            .ok()
            .map(|s| parse_addresses(&s))
            .unwrap_or(defaults.sim_devices);

        let scan_interval = env::var("I2C_USER_SCAN_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or(defaults.scan_interval);

        Self {
            device: DeviceConfig {
                name_prefix,
                functionality,
            },
            max_adapters,
            protocol,
            sim_devices,
            scan_interval,
        }
    }
}

fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

// Entries that are not 7-bit hex addresses are skipped
fn parse_addresses(s: &str) -> Vec<u8> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let hex = entry
                .strip_prefix("0x")
                .or_else(|| entry.strip_prefix("0X"))
                .unwrap_or(entry);
            match u8::from_str_radix(hex, 16) {
                Ok(addr) if addr <= crate::bus::MAX_ADDR => Some(addr),
                _ => {
                    warn!(entry, "Ignoring invalid simulated device address");
                    None
                }
            }
        })
        .collect()
}
