//! Shared receive loop and per-device demultiplexing.
//!
//! One dispatcher owns one UDP socket and routes every inbound datagram
//! to the session registered for its source address. Faulty traffic
//! (malformed datagrams, unknown sources, late packets after unregister)
//! is counted and dropped locally; it never reaches a session or the
//! caller, and no session's traffic can stall delivery to another.

use crate::protocol::{decode, encode, Message};
use crate::session::{SessionShared, StartError};
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Maximum UDP datagram size.
const UDP_MAX_BYTES: usize = 65535;

#[derive(Debug, Default)]
struct Metrics {
    unknown_source: AtomicU64,
    decode_errors: AtomicU64,
}

/// Snapshot of the dispatcher's drop counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    /// Datagrams from addresses with no registered session
    pub unknown_source: u64,
    /// Datagrams that failed to decode
    pub decode_errors: u64,
}

/// Routes inbound datagrams to active sessions by source address.
///
/// Cheaply cloneable handle; the receive loop runs as a spawned task
/// until [`shutdown`](Dispatcher::shutdown).
#[derive(Clone)]
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    routes: Arc<Mutex<HashMap<SocketAddr, Arc<SessionShared>>>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Binds the dispatcher socket on an ephemeral port and spawns the
    /// receive loop.
    pub async fn bind(bind_addr: Option<IpAddr>) -> io::Result<Self> {
        let ip = bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let socket = UdpSocket::bind((ip, 0)).await?;
        info!("dispatcher listening on {}", socket.local_addr()?);

        let dispatcher = Self {
            socket: Arc::new(socket),
            routes: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Metrics::default()),
            cancel: CancellationToken::new(),
        };
        tokio::spawn(dispatcher.clone().recv_loop());
        Ok(dispatcher)
    }

    /// Local address of the dispatcher socket. Devices reply here.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registers a session for a device address.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::DuplicateSession`] if a session is already
    /// active for that address; exactly one session per address.
    pub(crate) fn register(
        &self,
        addr: SocketAddr,
        session: Arc<SessionShared>,
    ) -> Result<(), StartError> {
        let mut routes = self.routes.lock();
        if routes.contains_key(&addr) {
            return Err(StartError::DuplicateSession(addr));
        }
        routes.insert(addr, session);
        debug!("registered session route for {addr}");
        Ok(())
    }

    /// Removes a session's route. Safe to call repeatedly.
    pub(crate) fn unregister(&self, addr: SocketAddr) {
        if self.routes.lock().remove(&addr).is_some() {
            debug!("unregistered session route for {addr}");
        }
    }

    /// Whether a route is currently registered for `addr`.
    pub fn has_route(&self, addr: SocketAddr) -> bool {
        self.routes.lock().contains_key(&addr)
    }

    /// Number of active session routes.
    pub fn route_count(&self) -> usize {
        self.routes.lock().len()
    }

    /// Sends an encoded message from the dispatcher socket.
    pub(crate) async fn send_to(&self, msg: &Message, addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(&encode(msg), addr).await?;
        Ok(())
    }

    /// Current drop counters.
    pub fn metrics(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            unknown_source: self.metrics.unknown_source.load(Ordering::Relaxed),
            decode_errors: self.metrics.decode_errors.load(Ordering::Relaxed),
        }
    }

    /// Stops the receive loop. Registered sessions are left in place;
    /// their watchdogs will time them out.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn recv_loop(self) {
        let mut buf = vec![0u8; UDP_MAX_BYTES];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("dispatcher shut down");
                    return;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.route(&buf[..len], addr),
                    Err(e) => error!("error receiving datagram: {e}"),
                }
            }
        }
    }

    /// Routing step for one datagram: decode, look up the source
    /// address, hand off. Short and non-blocking so one session's
    /// traffic cannot starve another's delivery.
    fn route(&self, bytes: &[u8], addr: SocketAddr) {
        let msg = match decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("discarding malformed datagram from {addr}: {e}");
                return;
            }
        };

        let session = self.routes.lock().get(&addr).cloned();
        match session {
            Some(session) => {
                if session.handle_message(msg) {
                    self.unregister(addr);
                }
            }
            None => {
                self.metrics.unknown_source.fetch_add(1, Ordering::Relaxed);
                debug!("discarding datagram from unknown source {addr}");
            }
        }
    }
}
