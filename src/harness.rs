//! Facade tying discovery, the registry, and the dispatcher together.

use crate::config::Config;
use crate::discovery::{self, DiscoveryResult};
use crate::dispatcher::{DispatchSnapshot, Dispatcher};
use crate::registry::{Device, DeviceId, DeviceRegistry};
use crate::session::{StartError, TestSession};
use log::info;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Entry point for external consumers (CLI/GUI collaborators).
///
/// Owns the device registry and the shared dispatcher socket. One
/// harness serves any number of concurrent test sessions.
///
/// # Examples
///
/// ```no_run
/// use dutnet::{Config, Harness};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let harness = Harness::new(Config::new()).await?;
///
/// let result = harness.discover().await?;
/// println!("{} devices responded", result.len());
///
/// if let Some(device) = harness.devices().first() {
///     let session = harness
///         .start_test(&device.id, Duration::from_secs(5))
///         .await?;
///     while let Some(sample) = session.next_sample().await {
///         println!("{} ms: {} mA", sample.elapsed_ms, sample.current_ma);
///     }
///     if let Some(summary) = session.summary() {
///         println!("mean current {} mA", summary.current.mean);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Harness {
    config: Config,
    registry: DeviceRegistry,
    dispatcher: Dispatcher,
}

impl Harness {
    /// Binds the dispatcher socket and spawns the shared receive loop.
    pub async fn new(config: Config) -> crate::Result<Self> {
        let dispatcher = Dispatcher::bind(config.bind_addr).await?;
        Ok(Self {
            config,
            registry: DeviceRegistry::new(),
            dispatcher,
        })
    }

    /// Runs one discovery round (see [`discovery::discover`]).
    pub async fn discover(&self) -> io::Result<DiscoveryResult> {
        discovery::discover(&self.registry, &self.config).await
    }

    /// All known devices in first-discovery order.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.list()
    }

    /// The underlying registry, for lookups and explicit pruning.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Starts a test against a discovered device.
    ///
    /// Looks the device up by identity (its address may have changed
    /// since an earlier discovery round; the registry holds the latest)
    /// and drives the session through its start handshake. The returned
    /// handle may already be `Failed(StartTimeout)` if the device never
    /// acknowledged; partial telemetry stays readable either way.
    ///
    /// # Errors
    ///
    /// * [`StartError::UnknownDevice`] - identity not in the registry
    /// * [`StartError::DuplicateSession`] - a session is already active
    ///   for the device's address
    /// * [`StartError::Send`] - the start command could not be sent
    pub async fn start_test(
        &self,
        id: &DeviceId,
        duration: Duration,
    ) -> Result<TestSession, StartError> {
        let device = self
            .registry
            .get(id)
            .ok_or_else(|| StartError::UnknownDevice(id.clone()))?;
        info!("starting {duration:?} test on {} at {}", device.id, device.addr);

        let session = TestSession::new(device, duration, &self.config, self.dispatcher.clone());
        session.start().await?;
        Ok(session)
    }

    /// Local address devices reply to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.dispatcher.local_addr()
    }

    /// Dispatcher drop counters (unknown sources, decode failures).
    pub fn metrics(&self) -> DispatchSnapshot {
        self.dispatcher.metrics()
    }

    /// Stops the shared receive loop. Active sessions fail via their
    /// inactivity watchdogs.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}
