//! Device inventory access and target resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::{DeviceFilter, DeviceTarget};
use crate::{Error, Result};

/// Supplies device targets. Implemented outside the core for real inventories.
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// A consistent snapshot of every known device.
    async fn snapshot(&self) -> Result<Vec<DeviceTarget>>;
}

/// In-memory inventory.
#[derive(Default)]
pub struct StaticInventory {
    devices: RwLock<BTreeMap<String, DeviceTarget>>,
}

impl StaticInventory {
    pub fn new(devices: impl IntoIterator<Item = DeviceTarget>) -> Self {
        let inventory = Self::default();
        for device in devices {
            inventory.upsert(device);
        }
        inventory
    }

    /// Insert or replace a device by hostname.
    pub fn upsert(&self, device: DeviceTarget) {
        self.devices.write().insert(device.hostname.clone(), device);
    }

    pub fn remove(&self, hostname: &str) -> Option<DeviceTarget> {
        self.devices.write().remove(hostname)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[async_trait]
impl InventorySource for StaticInventory {
    async fn snapshot(&self) -> Result<Vec<DeviceTarget>> {
        Ok(self.devices.read().values().cloned().collect())
    }
}

/// Resolves a [`DeviceFilter`] to the devices an operation runs against.
#[derive(Clone)]
pub struct TargetResolver {
    inventory: Arc<dyn InventorySource>,
}

impl TargetResolver {
    pub fn new(inventory: Arc<dyn InventorySource>) -> Self {
        Self { inventory }
    }

    /// Devices matching `filter`, ordered by hostname, from one inventory snapshot.
    ///
    /// Returns [`Error::EmptyTargetSet`] when nothing matches; callers decide
    /// whether that fails their job.
    pub async fn resolve(&self, filter: &DeviceFilter) -> Result<Vec<DeviceTarget>> {
        let mut targets: Vec<DeviceTarget> = self
            .inventory
            .snapshot()
            .await?
            .into_iter()
            .filter(|device| filter.matches(device))
            .collect();
        targets.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        targets.dedup_by(|a, b| a.hostname == b.hostname);

        if targets.is_empty() {
            return Err(Error::EmptyTargetSet(filter.to_string()));
        }
        debug!(%filter, devices = targets.len(), "Resolved device targets");
        Ok(targets)
    }

    /// One device by hostname, regardless of its managed flag.
    pub async fn lookup(&self, hostname: &str) -> Result<Option<DeviceTarget>> {
        Ok(self
            .inventory
            .snapshot()
            .await?
            .into_iter()
            .find(|device| device.hostname == hostname))
    }
}
