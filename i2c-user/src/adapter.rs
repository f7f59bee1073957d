//! Bus adapter registration and lifecycle.
//!
//! Opening the [`UserI2cDevice`] creates a session and registers a
//! [`UserBus`] adapter for it with the host [`I2cFramework`]. Clients of the
//! framework find the adapter by name and issue transfers against it; the
//! agent holding the returned [`DeviceFile`] services them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{Functionality, Message, Session},
    config::DeviceConfig,
    device::DeviceFile,
    error::{Error, Result},
    hw_trait::{self, I2c},
    tracing::prelude::*,
};

/// Transfer algorithm of a registered adapter, as seen by bus clients.
#[async_trait]
pub trait I2cAlgorithm: Send + Sync {
    /// Execute `msgs` as one transaction. Returns the number of messages
    /// completed.
    async fn master_xfer(&self, msgs: &mut [Message]) -> Result<usize>;

    /// Capabilities currently advertised.
    fn functionality(&self) -> Functionality;
}

/// Host I2C framework the adapters register with.
pub trait I2cFramework: Send + Sync {
    fn add_adapter(&self, name: &str, adapter: Arc<dyn I2cAlgorithm>) -> Result<()>;

    fn del_adapter(&self, name: &str);
}

/// In-process adapter registry.
pub struct BusRegistry {
    adapters: RwLock<BTreeMap<String, Arc<dyn I2cAlgorithm>>>,
    capacity: usize,
}

impl BusRegistry {
    /// Registry accepting at most `capacity` adapters at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            adapters: RwLock::new(BTreeMap::new()),
            capacity,
        }
    }

    /// Look up a registered adapter.
    pub fn get(&self, name: &str) -> Option<Arc<dyn I2cAlgorithm>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all registered adapters, sorted.
    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl I2cFramework for BusRegistry {
    fn add_adapter(&self, name: &str, adapter: Arc<dyn I2cAlgorithm>) -> Result<()> {
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        if adapters.contains_key(name) {
            return Err(Error::Registration(format!("{} already registered", name)));
        }
        if adapters.len() >= self.capacity {
            return Err(Error::Registration(format!(
                "registry full ({} adapters)",
                self.capacity
            )));
        }
        adapters.insert(name.to_string(), adapter);
        Ok(())
    }

    fn del_adapter(&self, name: &str) {
        let removed = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_none() {
            warn!(adapter = %name, "Removing adapter that was not registered");
        }
    }
}

/// Adapter whose transfers are serviced by the external agent.
#[derive(Clone)]
pub struct UserBus {
    session: Arc<Session>,
}

impl UserBus {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    /// Transfer that fails with `Interrupted` when `cancel` fires.
    pub async fn transfer_cancellable(
        &self,
        msgs: &mut [Message],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.session.transfer_cancellable(msgs, cancel).await
    }
}

#[async_trait]
impl I2cAlgorithm for UserBus {
    async fn master_xfer(&self, msgs: &mut [Message]) -> Result<usize> {
        self.session.transfer(msgs).await
    }

    fn functionality(&self) -> Functionality {
        self.session.functionality()
    }
}

#[async_trait]
impl I2c for UserBus {
    async fn transfer(&mut self, msgs: &mut [Message]) -> hw_trait::Result<usize> {
        Ok(self.master_xfer(msgs).await?)
    }
}

/// The user I2C character device.
///
/// Every [`open`](Self::open) creates a new bus adapter, named
/// `"<prefix> (#n)"` where n counts successful registrations.
pub struct UserI2cDevice {
    framework: Arc<dyn I2cFramework>,
    config: DeviceConfig,
    registered: Mutex<usize>,
}

impl UserI2cDevice {
    pub fn new(framework: Arc<dyn I2cFramework>, config: DeviceConfig) -> Self {
        Self {
            framework,
            config,
            registered: Mutex::new(0),
        }
    }

    /// Open a handle: create a session and register its adapter.
    ///
    /// If the framework rejects the adapter the session is released and the
    /// error returned.
    pub fn open(&self) -> Result<DeviceFile> {
        let mut registered = self.registered.lock().unwrap_or_else(PoisonError::into_inner);
        let name = format!("{} (#{})", self.config.name_prefix, *registered);

        let session = Arc::new(Session::new(name.clone(), self.config.functionality));
        let adapter: Arc<dyn I2cAlgorithm> = Arc::new(UserBus::new(Arc::clone(&session)));
        if let Err(e) = self.framework.add_adapter(&name, adapter) {
            error!(adapter = %name, error = %e, "Adapter registration failed");
            return Err(e);
        }
        *registered += 1;

        info!(adapter = %name, "Adapter registered");
        Ok(DeviceFile::new(session, Arc::clone(&self.framework)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::State, hw_trait::HwError};

    fn device(capacity: usize) -> (Arc<BusRegistry>, UserI2cDevice) {
        let registry = Arc::new(BusRegistry::new(capacity));
        let device = UserI2cDevice::new(registry.clone(), DeviceConfig::default());
        (registry, device)
    }

    #[test]
    fn test_open_registers_numbered_adapters() {
        let (registry, device) = device(4);
        let first = device.open().unwrap();
        let second = device.open().unwrap();

        assert_eq!(first.adapter_name(), "i2c-user (#0)");
        assert_eq!(second.adapter_name(), "i2c-user (#1)");
        assert_eq!(registry.names(), vec!["i2c-user (#0)", "i2c-user (#1)"]);
        assert_eq!(first.state(), State::Idle);
    }

    #[test]
    fn test_close_unregisters_adapter() {
        let (registry, device) = device(4);
        let file = device.open().unwrap();
        let bus = file.bus();
        file.close();

        assert!(registry.is_empty());
        // Adapter handles that outlive the file see a dead session
        assert_eq!(bus.session.state(), State::Terminated);
    }

    #[test]
    fn test_drop_unregisters_adapter() {
        let (registry, device) = device(4);
        {
            let _file = device.open().unwrap();
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_failure_propagates() {
        let (registry, device) = device(1);
        let first = device.open().unwrap();

        assert!(matches!(device.open(), Err(Error::Registration(_))));
        assert_eq!(registry.len(), 1);

        // Failed attempts do not consume a number
        drop(first);
        let next = device.open().unwrap();
        assert_eq!(next.adapter_name(), "i2c-user (#1)");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = BusRegistry::new(4);
        let session = Arc::new(Session::new("dup", Functionality::default()));
        let adapter: Arc<dyn I2cAlgorithm> = Arc::new(UserBus::new(session));

        registry.add_adapter("dup", adapter.clone()).unwrap();
        assert!(matches!(
            registry.add_adapter("dup", adapter),
            Err(Error::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_i2c_write_read_through_agent() {
        let (registry, device) = device(4);
        let file = Arc::new(device.open().unwrap());
        let mut bus = file.bus();
        assert!(registry.get(bus.name()).is_some());

        let agent = {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                file.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..2], &[0x98, 0x01]);
                file.read(&mut buf[..1]).await.unwrap();
                assert_eq!(buf[0], 0x00);

                file.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..2], &[0x99, 0x02]);
                file.write(&[0x19, 0x80]).await.unwrap();
            })
        };

        let mut temp = [0u8; 2];
        bus.write_read(0x4c, &[0x00], &mut temp).await.unwrap();
        assert_eq!(temp, [0x19, 0x80]);
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_i2c_short_read_is_error() {
        let (_registry, device) = device(4);
        let file = Arc::new(device.open().unwrap());
        let mut bus = file.bus();

        let agent = {
            let file = Arc::clone(&file);
            tokio::spawn(async move {
                let mut buf = [0u8; 2];
                file.read(&mut buf).await.unwrap();
                file.write(&[0x01]).await.unwrap();
            })
        };

        let mut data = [0u8; 2];
        assert!(matches!(
            bus.read(0x4c, &mut data).await,
            Err(HwError::InvalidParameter(_))
        ));
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn test_set_frequency_not_supported() {
        let (_registry, device) = device(4);
        let file = device.open().unwrap();
        let mut bus = file.bus();
        assert!(matches!(
            bus.set_frequency(400_000).await,
            Err(HwError::NotSupported(_))
        ));
    }
}
