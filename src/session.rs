//! Per-device test sessions.
//!
//! A [`TestSession`] tracks a single test run against one device: it
//! sends the start command, consumes the device's reply stream (routed
//! to it by the dispatcher), accumulates samples, and exposes the
//! terminal summary. Sessions are never reused; one test run, one
//! session.

use crate::aggregate::{AggregateSummary, Aggregator};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::protocol::{Centi, Message};
use crate::registry::{Device, DeviceId};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One telemetry sample reported by a device during a test.
///
/// The elapsed time is the device's own clock, not locally measured;
/// late or duplicate packets may make it non-monotonic across the
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    /// Milliseconds since test start, as reported by the device
    pub elapsed_ms: u64,
    /// Current in milliamps
    pub current_ma: Centi,
    /// Voltage in millivolts
    pub voltage_mv: Centi,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// No `TestStarted` arrived before the response deadline
    StartTimeout,
    /// Inter-sample silence exceeded the inactivity timeout
    InactivityTimeout,
    /// The device reported an error
    DeviceError(String),
    /// The caller aborted the session
    Aborted,
}

/// Session lifecycle state.
///
/// `Completed` and `Failed` are terminal; a session never leaves them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum State {
    Idle,
    Starting,
    Running,
    Completed,
    Failed(FailureReason),
}

impl State {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Failed(_))
    }
}

/// Errors that prevent a session from starting at all.
///
/// Conditions that arise *after* the start command was sent (handshake
/// timeout, device error) are session failures, surfaced through
/// [`TestSession::state`] rather than through this error.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("a session is already active for {0}")]
    DuplicateSession(SocketAddr),

    #[error("failed to send start command: {0}")]
    Send(#[from] std::io::Error),

    #[error("session was already started; create a new session per test run")]
    AlreadyStarted,
}

struct Inner {
    state: State,
    // Append-only receipt-order history. Never truncated; the bounded
    // delivery buffer is the cursor below, not this vec.
    samples: Vec<Sample>,
    aggregator: Aggregator,
    // Next undelivered sample for the pull consumer.
    cursor: usize,
    overflow: u64,
    buffer: usize,
    last_activity: Instant,
    running_since: Option<Instant>,
}

/// Session state shared between the handle, the dispatcher's receive
/// loop, and the watchdog task.
pub(crate) struct SessionShared {
    addr: SocketAddr,
    device: DeviceId,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl SessionShared {
    pub(crate) fn new(addr: SocketAddr, device: DeviceId, buffer: usize) -> Self {
        Self {
            addr,
            device,
            inner: Mutex::new(Inner {
                state: State::Idle,
                samples: Vec::new(),
                aggregator: Aggregator::new(),
                cursor: 0,
                overflow: 0,
                buffer: buffer.max(1),
                last_activity: Instant::now(),
                running_since: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Applies one inbound message to the state machine.
    ///
    /// Returns `true` when the message drove the session into a
    /// terminal state, so the dispatcher can drop the route. The
    /// transition function is total: undefined (state, message) pairs
    /// are logged no-ops, never panics.
    pub(crate) fn handle_message(&self, msg: Message) -> bool {
        let mut inner = self.inner.lock();
        let state = inner.state.clone();
        let terminal = match (state, msg) {
            (State::Starting, Message::TestStarted) => {
                info!("{}: test started", self.device);
                let now = Instant::now();
                inner.state = State::Running;
                inner.running_since = Some(now);
                inner.last_activity = now;
                false
            }
            (
                State::Running,
                Message::StatusUpdate {
                    elapsed_ms,
                    current_ma,
                    voltage_mv,
                },
            ) => {
                let sample = Sample {
                    elapsed_ms,
                    current_ma,
                    voltage_mv,
                };
                inner.samples.push(sample);
                inner.aggregator.update(&sample);
                inner.last_activity = Instant::now();
                let backlog = inner.samples.len() - inner.cursor;
                if backlog > inner.buffer {
                    let skipped = backlog - inner.buffer;
                    inner.cursor += skipped;
                    inner.overflow += skipped as u64;
                }
                false
            }
            (State::Running, Message::TestCompleted) => {
                info!(
                    "{}: test completed, {} samples",
                    self.device,
                    inner.samples.len()
                );
                inner.state = State::Completed;
                true
            }
            (State::Starting | State::Running, Message::Error { reason }) => {
                warn!("{}: device error: {}", self.device, reason);
                inner.state = State::Failed(FailureReason::DeviceError(reason));
                true
            }
            (state, msg) => {
                debug!(
                    "{}: ignoring {:?} in state {:?}",
                    self.device, msg, state
                );
                return false;
            }
        };
        drop(inner);
        self.notify.notify_waiters();
        terminal
    }

    fn fail(&self, reason: FailureReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = State::Failed(reason);
        drop(inner);
        self.notify.notify_waiters();
        true
    }
}

/// Handle to one test run against one device.
///
/// Created by [`Harness::start_test`](crate::Harness::start_test). The
/// handle stays valid after the session reaches a terminal state: the
/// full sample history and summary remain readable until it is dropped.
pub struct TestSession {
    shared: Arc<SessionShared>,
    dispatcher: Dispatcher,
    duration: Duration,
    config: Config,
}

impl TestSession {
    pub(crate) fn new(
        device: Device,
        duration: Duration,
        config: &Config,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(
                device.addr,
                device.id,
                config.sample_buffer,
            )),
            dispatcher,
            duration,
            config: config.clone(),
        }
    }

    /// Starts the test: registers with the dispatcher, sends the start
    /// command unicast, then suspends until the handshake resolves.
    ///
    /// Returns `Ok(())` once the handshake outcome is known; check
    /// [`state`](Self::state) for `Running` versus
    /// `Failed(StartTimeout)` / `Failed(DeviceError)`. The caller is
    /// suspended only for the handshake, never for the test duration.
    ///
    /// # Errors
    ///
    /// * [`StartError::DuplicateSession`] - another session is already
    ///   registered for this device address
    /// * [`StartError::Send`] - the start command could not be sent
    /// * [`StartError::AlreadyStarted`] - this session was used before
    pub async fn start(&self) -> Result<(), StartError> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                State::Idle => inner.state = State::Starting,
                _ => return Err(StartError::AlreadyStarted),
            }
        }

        if let Err(e) = self
            .dispatcher
            .register(self.shared.addr, self.shared.clone())
        {
            self.shared.inner.lock().state = State::Idle;
            return Err(e);
        }

        let cmd = Message::start_test(self.duration.as_secs(), self.config.status_rate_ms);
        if let Err(e) = self.dispatcher.send_to(&cmd, self.shared.addr).await {
            self.dispatcher.unregister(self.shared.addr);
            self.shared.inner.lock().state = State::Idle;
            return Err(StartError::Send(e));
        }
        debug!(
            "start command sent to {} at {}, duration {:?}",
            self.shared.device, self.shared.addr, self.duration
        );

        tokio::spawn(watchdog(
            self.shared.clone(),
            self.dispatcher.clone(),
            self.duration,
            self.config.clone(),
        ));

        // Suspend until the device answers or the watchdog times out.
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !matches!(self.shared.inner.lock().state, State::Starting) {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Pulls the next telemetry sample.
    ///
    /// Replays buffered samples first, then waits for live ones.
    /// Returns `None` once the session is terminal and every buffered
    /// sample has been delivered. Consumption never blocks the shared
    /// receive loop; a lagging consumer loses oldest samples instead
    /// (see [`overflow_count`](Self::overflow_count)).
    pub async fn next_sample(&self) -> Option<Sample> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.shared.inner.lock();
                if inner.cursor < inner.samples.len() {
                    let sample = inner.samples[inner.cursor];
                    inner.cursor += 1;
                    return Some(sample);
                }
                if inner.state.is_terminal() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Returns the full append-only sample history in receipt order.
    ///
    /// Available at any time, including after a failure: partial
    /// results are never discarded.
    pub fn samples(&self) -> Vec<Sample> {
        self.shared.inner.lock().samples.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.shared.inner.lock().state.clone()
    }

    /// Running statistics, or `None` before the first sample.
    pub fn summary(&self) -> Option<AggregateSummary> {
        self.shared.inner.lock().aggregator.summary()
    }

    /// Number of samples dropped from the delivery buffer because the
    /// consumer lagged more than the configured capacity.
    pub fn overflow_count(&self) -> u64 {
        self.shared.inner.lock().overflow
    }

    /// Identity of the device this session runs against.
    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Device command address this session is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Aborts the session.
    ///
    /// Immediately unregisters it from the dispatcher and marks it
    /// `Failed(Aborted)`; datagrams arriving afterwards are discarded
    /// as unknown. Idempotent: aborting a terminal session is a no-op.
    pub fn abort(&self) {
        if self.shared.fail(FailureReason::Aborted) {
            info!("{}: session aborted", self.shared.device);
            self.dispatcher.unregister(self.shared.addr);
        }
    }
}

/// Deadline enforcement for one session.
///
/// Covers the start-handshake deadline, the running inactivity timeout,
/// and duration-plus-grace completion for devices whose final
/// `TestCompleted` went missing. Exits as soon as the session is
/// terminal, removing the dispatch route if it performed the terminal
/// transition itself.
async fn watchdog(
    shared: Arc<SessionShared>,
    dispatcher: Dispatcher,
    duration: Duration,
    config: Config,
) {
    let start_deadline = Instant::now() + config.response_timeout;
    loop {
        let wake_at = {
            let inner = shared.inner.lock();
            match &inner.state {
                State::Starting => start_deadline,
                State::Running => {
                    let since = inner.running_since.unwrap_or_else(Instant::now);
                    let completion = (since + duration).max(inner.last_activity) + config.completion_grace;
                    completion.min(inner.last_activity + config.inactivity_timeout)
                }
                _ => return,
            }
        };
        tokio::time::sleep_until(wake_at).await;

        let transition = {
            let mut inner = shared.inner.lock();
            let now = Instant::now();
            let state = inner.state.clone();
            match state {
                State::Starting if now >= start_deadline => {
                    inner.state = State::Failed(FailureReason::StartTimeout);
                    Some(State::Failed(FailureReason::StartTimeout))
                }
                State::Running => {
                    let since = inner.running_since.unwrap_or(now);
                    let duration_over = now >= since + duration;
                    let quiet_for = now.saturating_duration_since(inner.last_activity);
                    if duration_over && quiet_for >= config.completion_grace {
                        inner.state = State::Completed;
                        Some(State::Completed)
                    } else if quiet_for >= config.inactivity_timeout {
                        inner.state = State::Failed(FailureReason::InactivityTimeout);
                        Some(State::Failed(FailureReason::InactivityTimeout))
                    } else {
                        None
                    }
                }
                State::Idle | State::Starting => None,
                _ => return,
            }
        };

        if let Some(state) = transition {
            match &state {
                State::Completed => info!("{}: completed after duration elapsed", shared.device),
                State::Failed(FailureReason::StartTimeout) => {
                    warn!("{}: no reply to start command", shared.device)
                }
                State::Failed(FailureReason::InactivityTimeout) => {
                    warn!("{}: telemetry went silent mid-run", shared.device)
                }
                _ => {}
            }
            dispatcher.unregister(shared.addr);
            shared.notify.notify_waiters();
            return;
        }
    }
}
