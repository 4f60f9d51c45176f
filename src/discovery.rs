//! Multicast device discovery.
//!
//! A discovery run broadcasts a probe to the multicast group and then
//! collects responses for a fixed wall-clock window; devices may
//! answer at any point inside it, so the window never closes early.
//! Responses are de-duplicated by device identity, keeping the most
//! recently seen address. Zero responders is a normal empty result,
//! not an error.

use crate::config::Config;
use crate::protocol::{decode, encode, Message};
use crate::registry::{Device, DeviceId, DeviceRegistry};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

const UDP_MAX_BYTES: usize = 65535;

/// Immutable snapshot of one discovery run.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    devices: Vec<Device>,
    window: Duration,
    malformed: u64,
}

impl DiscoveryResult {
    /// Devices that responded, ordered by identity (model, then
    /// serial).
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Identities of the responders, for registry pruning.
    pub fn ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.iter().map(|d| &d.id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The collection window this snapshot was gathered over.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// How many datagrams arrived during the window but were discarded
    /// as malformed or unexpected.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

/// Runs one discovery round and merges the result into the registry.
///
/// Sends a [`Message::DiscoveryProbe`] to the configured multicast
/// group from an ephemeral socket, then collects unicast replies until
/// the hard `discovery_timeout` deadline. Malformed responses are
/// logged and counted, never fatal. Registry entries for devices that
/// did not respond are left untouched; pruning is the caller's
/// explicit [`DeviceRegistry::prune_absent`] call.
///
/// # Errors
///
/// Only socket-level failures (bind, send, receive) surface as errors.
pub async fn discover(
    registry: &DeviceRegistry,
    config: &Config,
) -> io::Result<DiscoveryResult> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    if config.multicast_addr.is_ipv4() {
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
    }

    socket
        .send_to(&encode(&Message::DiscoveryProbe), config.multicast_addr)
        .await?;
    debug!(
        "discovery probe sent to {}, collecting for {:?}",
        config.multicast_addr, config.discovery_timeout
    );

    // Identity-keyed so duplicates collapse, later address winning;
    // BTreeMap gives the model-then-serial result order for free.
    let mut found: BTreeMap<DeviceId, Device> = BTreeMap::new();
    let mut malformed = 0u64;
    let mut buf = vec![0u8; UDP_MAX_BYTES];
    let deadline = Instant::now() + config.discovery_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match decode(&buf[..len]) {
                Ok(Message::DiscoveryResponse { model, serial }) => {
                    let id = DeviceId::new(model, serial);
                    debug!("discovery response from {addr}: {id}");
                    found.insert(id.clone(), Device::new(id, addr));
                }
                Ok(other) => {
                    malformed += 1;
                    debug!("unexpected {other:?} during discovery from {addr}");
                }
                Err(e) => {
                    malformed += 1;
                    debug!("malformed discovery response from {addr}: {e}");
                }
            },
            Ok(Err(e)) => return Err(e),
            // Window closed while waiting
            Err(_) => break,
        }
    }

    for device in found.values() {
        registry.upsert(device.clone());
    }
    info!(
        "{} devices found after waiting {:?} ({} malformed responses discarded)",
        found.len(),
        config.discovery_timeout,
        malformed
    );

    Ok(DiscoveryResult {
        devices: found.into_values().collect(),
        window: config.discovery_timeout,
        malformed,
    })
}
