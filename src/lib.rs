//! dutnet - test-automation network core for hardware validation
//!
//! This library discovers measurement devices (DUTs) on a local network
//! via UDP multicast, issues test-start commands, and collects
//! concurrent telemetry streams from many devices testing
//! simultaneously, demultiplexing inbound packets by source address and
//! exposing each device's telemetry as an independent pull-based stream
//! with live aggregate statistics.
//!
//! # Features
//!
//! - Multicast device discovery with identity de-duplication
//! - Semicolon-delimited textual wire protocol, total decoding
//! - Per-device test-session state machines with timeout handling
//! - Shared receive loop demultiplexing many concurrent sessions
//! - Exact fixed-point streaming aggregation (mean/max/min)
//! - Asynchronous I/O using tokio
//!
//! # Quick start
//!
//! ```no_run
//! use dutnet::{Config, Harness};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let harness = Harness::new(Config::new()).await?;
//! let found = harness.discover().await?;
//! for device in found.devices() {
//!     println!("{} at {}", device.id, device.addr);
//! }
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod harness;
pub mod protocol;
pub mod registry;
pub mod session;

pub use aggregate::{AggregateSummary, Aggregator, ChannelSummary};
pub use config::Config;
pub use discovery::DiscoveryResult;
pub use dispatcher::DispatchSnapshot;
pub use error::{Error, Result};
pub use harness::Harness;
pub use protocol::{Centi, DecodeError, Message};
pub use registry::{Device, DeviceId, DeviceRegistry};
pub use session::{FailureReason, Sample, StartError, State, TestSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes logging for binaries and tests that have no logger of
/// their own.
///
/// `verbose` maps to debug-level output, matching
/// [`Config::verbose`](Config). Safe to call more than once; later
/// calls are ignored.
pub fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .is_test(false)
        .try_init();
}
