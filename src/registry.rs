//! In-memory registry of discovered devices.
//!
//! Devices are keyed by [`DeviceId`] (model + serial), never by network
//! address: devices move and rebind between discovery runs, so the
//! address is mutable metadata while the identity is the stable key.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Stable identity of a device under test.
///
/// # Examples
///
/// ```
/// use dutnet::DeviceId;
///
/// let id = DeviceId::new("M001", "SN0123457");
/// assert_eq!(id.to_string(), "M001/SN0123457");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId {
    pub model: String,
    pub serial: String,
}

impl DeviceId {
    pub fn new(model: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            serial: serial.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.serial)
    }
}

/// A discovered device: stable identity plus current network metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Stable identity (immutable once discovered)
    pub id: DeviceId,
    /// Command address from the most recent discovery response
    pub addr: SocketAddr,
    /// When the device last answered a discovery probe
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(id: DeviceId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Utc::now(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    // Insertion-ordered devices plus an identity index into the vec.
    devices: Vec<Device>,
    index: HashMap<DeviceId, usize>,
}

/// Thread-safe, cheaply cloneable registry of discovered devices.
///
/// `list()` returns devices in first-discovery order, stable across
/// reads until the next mutation. Entries are only removed by the
/// explicit [`prune_absent`](DeviceRegistry::prune_absent) /
/// [`remove`](DeviceRegistry::remove) calls, never as a side effect of
/// discovery.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a device, or refreshes the address and last-seen
    /// timestamp of an already-known identity.
    pub fn upsert(&self, device: Device) {
        let mut inner = self.inner.write();
        match inner.index.get(&device.id).copied() {
            Some(i) => {
                inner.devices[i].addr = device.addr;
                inner.devices[i].last_seen = device.last_seen;
            }
            None => {
                let i = inner.devices.len();
                inner.index.insert(device.id.clone(), i);
                inner.devices.push(device);
            }
        }
    }

    /// Looks up a device by identity.
    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        let inner = self.inner.read();
        inner.index.get(id).map(|&i| inner.devices[i].clone())
    }

    /// Returns all known devices in first-discovery order.
    pub fn list(&self) -> Vec<Device> {
        self.inner.read().devices.clone()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().devices.is_empty()
    }

    /// Removes a device by identity. Returns whether it was present.
    pub fn remove(&self, id: &DeviceId) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        if let Some(i) = inner.index.remove(id) {
            inner.devices.remove(i);
            // Reindex everything after the removed slot.
            for (j, d) in inner.devices.iter().enumerate().skip(i) {
                inner.index.insert(d.id.clone(), j);
            }
            true
        } else {
            false
        }
    }

    /// Drops every device whose identity is not in `seen`.
    ///
    /// This is the caller-controlled pruning step after a discovery
    /// round; discovery itself only merges and never removes.
    pub fn prune_absent<'a>(&self, seen: impl IntoIterator<Item = &'a DeviceId>) {
        let keep: std::collections::HashSet<&DeviceId> = seen.into_iter().collect();
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.devices.retain(|d| keep.contains(&d.id));
        inner.index = inner
            .devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
    }
}
