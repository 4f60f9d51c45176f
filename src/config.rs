use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default multicast group used by DUT simulators.
pub const DEFAULT_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 3, 11, 15);

/// Default multicast port used by DUT simulators.
pub const DEFAULT_MULTICAST_PORT: u16 = 31115;

/// Configuration for the test-automation network core.
///
/// Holds the discovery, handshake, and telemetry-delivery parameters.
/// Use the builder pattern methods to customize the configuration.
///
/// # Examples
///
/// ## Defaults
///
/// ```
/// use dutnet::Config;
///
/// let config = Config::new();
/// assert_eq!(config.multicast_addr.port(), 31115);
/// ```
///
/// ## Tuned for a slow test floor
///
/// ```
/// use dutnet::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_discovery_timeout(Duration::from_secs(3))
///     .with_response_timeout(Duration::from_secs(5))
///     .with_inactivity_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multicast group address and port for discovery probes
    pub multicast_addr: SocketAddr,

    /// Time-to-live for outbound multicast probes
    pub multicast_ttl: u32,

    /// Hard wall-clock window during which discovery responses are
    /// collected
    pub discovery_timeout: Duration,

    /// How long to wait for a device's TestStarted reply after sending
    /// the start command
    pub response_timeout: Duration,

    /// Maximum inter-sample silence tolerated while a test is running
    pub inactivity_timeout: Duration,

    /// Extra time past the configured test duration to wait for a
    /// final in-flight packet before declaring completion
    pub completion_grace: Duration,

    /// Status report period requested from devices, in milliseconds
    pub status_rate_ms: u64,

    /// Per-session delivery buffer: maximum number of samples a lagging
    /// consumer can fall behind before the oldest are dropped
    pub sample_buffer: usize,

    /// Local address the dispatcher socket binds to (default: any)
    pub bind_addr: Option<IpAddr>,

    /// Enable debug-level logging
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multicast_addr: SocketAddr::V4(SocketAddrV4::new(
                DEFAULT_MULTICAST_ADDR,
                DEFAULT_MULTICAST_PORT,
            )),
            multicast_ttl: 2,
            discovery_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(2),
            inactivity_timeout: Duration::from_secs(3),
            completion_grace: Duration::from_millis(500),
            status_rate_ms: 100,
            sample_buffer: 1024,
            bind_addr: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    ///
    /// Equivalent to `Config::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the multicast group address and port for discovery.
    ///
    /// # Examples
    ///
    /// ```
    /// use dutnet::Config;
    ///
    /// let config = Config::new()
    ///     .with_multicast_addr("224.3.11.15:31115".parse().unwrap());
    /// ```
    pub fn with_multicast_addr(mut self, addr: SocketAddr) -> Self {
        self.multicast_addr = addr;
        self
    }

    /// Sets the TTL for outbound multicast probes.
    pub fn with_multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    /// Sets the discovery collection window.
    ///
    /// Discovery blocks for exactly this long; devices may respond at
    /// any point inside the window.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the start-command response deadline.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Sets the maximum tolerated inter-sample silence for a running
    /// session.
    ///
    /// The default of 3 seconds is 30 missed status periods at the
    /// default 100 ms rate.
    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Sets the grace period past the configured test duration before a
    /// silent session is declared complete.
    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    /// Sets the status report period requested from devices.
    ///
    /// # Arguments
    ///
    /// * `rate_ms` - Milliseconds between device status reports
    pub fn with_status_rate_ms(mut self, rate_ms: u64) -> Self {
        self.status_rate_ms = rate_ms;
        self
    }

    /// Sets the per-session delivery buffer capacity.
    ///
    /// Live telemetry favors recency: when a consumer falls more than
    /// this many samples behind, the oldest undelivered samples are
    /// skipped and counted in the session's overflow counter.
    pub fn with_sample_buffer(mut self, capacity: usize) -> Self {
        self.sample_buffer = capacity.max(1);
        self
    }

    /// Sets the local address the dispatcher socket binds to.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Enables or disables debug-level logging.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}
