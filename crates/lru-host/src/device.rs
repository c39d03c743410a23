//! Device table with scoped references.
//!
//! A [`DeviceRef`] pins a device for as long as it is held; dropping it
//! releases the reference. A device removed from the table while referenced
//! stays readable through the outstanding guards but is no longer returned
//! by [`DeviceTable::try_get`].

use lru_types::{BucketRef, MAX_DEVICES};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Static geometry of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u16,
    /// Bucket size in 512-byte sectors.
    pub bucket_size: u32,
    pub nbuckets: u64,
}

impl DeviceInfo {
    /// Whether `bucket` addresses a bucket of this device.
    #[must_use]
    pub fn contains(&self, bucket: BucketRef) -> bool {
        bucket.dev == self.index && bucket.bucket < self.nbuckets
    }
}

#[derive(Debug)]
struct DeviceSlot {
    info: DeviceInfo,
    refs: AtomicUsize,
}

/// Scoped reference to a live device.
#[derive(Debug)]
pub struct DeviceRef {
    slot: Arc<DeviceSlot>,
}

impl DeviceRef {
    fn acquire(slot: &Arc<DeviceSlot>) -> Self {
        slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: Arc::clone(slot),
        }
    }
}

impl Deref for DeviceRef {
    type Target = DeviceInfo;

    fn deref(&self) -> &DeviceInfo {
        &self.slot.info
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        self.slot.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lookup of devices by index.
pub trait DeviceTable: Send + Sync {
    /// Acquire a reference to device `dev` if it currently exists.
    fn try_get(&self, dev: u16) -> Option<DeviceRef>;

    fn device_exists(&self, dev: u16) -> bool {
        self.try_get(dev).is_some()
    }
}

/// In-memory device table.
#[derive(Debug, Default)]
pub struct MemDeviceTable {
    devices: RwLock<BTreeMap<u16, Arc<DeviceSlot>>>,
}

impl MemDeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, replacing any previous one with the same index.
    ///
    /// Returns `false` if the index is outside `0..MAX_DEVICES`.
    pub fn add(&self, info: DeviceInfo) -> bool {
        if info.index >= MAX_DEVICES {
            return false;
        }
        let slot = Arc::new(DeviceSlot {
            info,
            refs: AtomicUsize::new(0),
        });
        self.devices.write().insert(info.index, slot);
        true
    }

    pub fn remove(&self, dev: u16) -> Option<DeviceInfo> {
        self.devices.write().remove(&dev).map(|slot| slot.info)
    }

    /// Number of outstanding [`DeviceRef`]s on `dev`.
    #[must_use]
    pub fn active_refs(&self, dev: u16) -> usize {
        self.devices
            .read()
            .get(&dev)
            .map_or(0, |slot| slot.refs.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn list(&self) -> Vec<DeviceInfo> {
        self.devices.read().values().map(|slot| slot.info).collect()
    }
}

impl DeviceTable for MemDeviceTable {
    fn try_get(&self, dev: u16) -> Option<DeviceRef> {
        self.devices.read().get(&dev).map(DeviceRef::acquire)
    }
}
