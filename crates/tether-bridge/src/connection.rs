//! Connection lifecycle: state machine, reconnect backoff and health.
//!
//! [`ConnectionManager`] is a cheap handle onto a single driver task that
//! exclusively owns the transport link. Handles talk to the driver over a
//! command channel; the driver reacts to commands, link events, the pending
//! connect attempt and the reconnect timer from one `select!` loop, so the
//! state machine is only ever mutated from one place.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──open──▶ Open ──close/error──▶ Idle
//!                       │                  │
//!                       └──fail/timeout──▶ Error ──backoff──▶ Connecting
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use tether_core::constants::{CLOSE_ABNORMAL, CLOSE_NORMAL};
use tether_core::{
    BridgeError, ConnectionMetrics, HealthTracker, LinkId, Message, QualityChange,
    ReconnectPolicy, Result,
};
use tether_settings::BridgeSettings;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, info, trace, warn};

use crate::metrics::{
    CONNECTIONS_TOTAL, DECODE_FAILURES_TOTAL, HEARTBEAT_LATENCY_SECONDS, MESSAGES_RECEIVED_TOTAL,
    MESSAGES_SENT_TOTAL, RECONNECTS_TOTAL,
};
use crate::transport::{Frame, Transport, TransportEvent, TransportLink};

/// Lifecycle state of the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link and no attempt in flight.
    #[default]
    Idle,
    /// An open attempt is in flight.
    Connecting,
    /// The link is usable.
    Open,
    /// A clean close is being written.
    Closing,
    /// The last attempt failed; a reconnect may be pending.
    Error,
}

/// Lifecycle notifications published by the connection manager.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A link opened.
    Connected {
        /// The new link.
        link_id: LinkId,
    },
    /// The link closed.
    Disconnected {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A connect attempt or the link reported an error.
    Error {
        /// What went wrong.
        error: BridgeError,
    },
    /// A reconnect was scheduled.
    Reconnecting {
        /// One-based index of the upcoming attempt.
        attempt: u32,
        /// Delay before it starts.
        delay: Duration,
    },
    /// The attempt ceiling was reached; retrying stops until an explicit
    /// connect.
    ReconnectExhausted {
        /// Consecutive attempts made.
        attempts: u32,
    },
    /// The quality bucket changed.
    QualityChanged(QualityChange),
}

/// Connection manager parameters.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Reconnect backoff and ceiling.
    pub policy: ReconnectPolicy,
    /// Time allowed for one attempt to reach `Open`.
    pub connect_timeout: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl ConnectionConfig {
    /// Derive from bridge settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            policy: settings.reconnect_policy(),
            connect_timeout: settings.connection_timeout(),
            event_capacity: settings.event_capacity,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

enum Command {
    Connect {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    ForceReconnect {
        code: u16,
        reason: String,
    },
    Shutdown,
}

struct Shared {
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<mpsc::Sender<Frame>>>,
    link_id: RwLock<Option<LinkId>>,
    health: Mutex<HealthTracker>,
    events: broadcast::Sender<ConnectionEvent>,
    retry_pending: AtomicBool,
    exhausted: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            trace!(from = ?*current, to = ?state, "connection state");
            *current = state;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // Err only means nobody is subscribed
        let _ = self.events.send(event);
    }

    fn record_error(&self) {
        let change = self.health.lock().record_error();
        if let Some(change) = change {
            self.emit(ConnectionEvent::QualityChanged(change));
        }
    }
}

/// Handle onto the connection driver.
///
/// Cloning is cheap; all clones drive the same connection. Dropping the last
/// handle (or calling [`shutdown`](Self::shutdown)) stops the driver and
/// closes the link.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectionManager {
    /// Spawn the driver for `transport`.
    ///
    /// Returns the handle and the receiver of decoded inbound messages.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Idle),
            writer: Mutex::new(None),
            link_id: RwLock::new(None),
            health: Mutex::new(HealthTracker::new()),
            events,
            retry_pending: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (incoming, incoming_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            shared: Arc::clone(&shared),
            transport,
            config,
            commands: command_rx,
            incoming,
            attempt: None,
            link: None,
            reconnect: None,
            waiters: Vec::new(),
            attempts: 0,
        };
        let _ = tokio::spawn(driver.run());

        (Self { shared, commands }, incoming_rx)
    }

    /// Open the connection and wait for the outcome.
    ///
    /// No-op when already open; joins the in-flight attempt when connecting.
    /// After the reconnect ceiling was reached this resets the attempt
    /// counter and resumes the retry cycle.
    pub async fn connect(&self) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Connect { reply: Some(reply) })
            .map_err(|_| BridgeError::BridgeDestroyed)?;
        outcome.await.map_err(|_| BridgeError::BridgeDestroyed)?
    }

    /// Start connecting without waiting for the outcome.
    pub fn request_connect(&self) {
        let _ = self.commands.send(Command::Connect { reply: None });
    }

    /// Close cleanly (1000) and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Drop the current link with `code` and go through the reconnect path.
    pub fn force_reconnect(&self, code: u16, reason: impl Into<String>) {
        let _ = self.commands.send(Command::ForceReconnect {
            code,
            reason: reason.into(),
        });
    }

    /// Stop the driver, closing the link if open.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Serialize and write `message`.
    ///
    /// Fails with [`BridgeError::NotConnected`] unless the link is open.
    pub fn send(&self, message: &Message) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(BridgeError::NotConnected);
        }
        let text = message.to_json()?;
        {
            let writer = self.shared.writer.lock();
            let Some(tx) = writer.as_ref() else {
                return Err(BridgeError::NotConnected);
            };
            tx.try_send(Frame::Text(text)).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    BridgeError::Connection("outbound buffer full".into())
                }
                mpsc::error::TrySendError::Closed(_) => BridgeError::NotConnected,
            })?;
        }
        self.shared.health.lock().record_sent();
        counter!(MESSAGES_SENT_TOTAL).increment(1);
        trace!(message_id = %message.id, action = %message.action, "message written");
        Ok(())
    }

    /// Feed a heartbeat round-trip into the health tracker.
    pub fn record_latency(&self, latency: Duration) {
        let now = tokio::time::Instant::now().into_std();
        let change = self.shared.health.lock().record_latency(latency, now);
        histogram!(HEARTBEAT_LATENCY_SECONDS).record(latency.as_secs_f64());
        if let Some(change) = change {
            debug!(previous = %change.previous, current = %change.current, "connection quality changed");
            self.shared.emit(ConnectionEvent::QualityChanged(change));
        }
    }

    /// Snapshot of the connection metrics.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.health.lock().snapshot()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Whether the link is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// ID of the open link, if any. A new value means a new link.
    pub fn link_id(&self) -> Option<LinkId> {
        self.shared.link_id.read().clone()
    }

    /// Whether a reconnect timer is armed.
    pub fn is_retry_pending(&self) -> bool {
        self.shared.retry_pending.load(Ordering::Relaxed)
    }

    /// Whether the reconnect ceiling was reached.
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::Relaxed)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<TransportLink>> + Send>>;

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::UnboundedSender<Message>,
    attempt: Option<OpenFuture>,
    link: Option<(LinkId, mpsc::Receiver<TransportEvent>)>,
    reconnect: Option<Pin<Box<Sleep>>>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    attempts: u32,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                result = next_attempt(&mut self.attempt), if self.attempt.is_some() => {
                    self.attempt = None;
                    self.on_attempt(result);
                }
                event = next_link_event(&mut self.link), if self.link.is_some() => {
                    self.on_link_event(event);
                }
                () = next_timer(&mut self.reconnect), if self.reconnect.is_some() => {
                    self.reconnect = None;
                    self.shared.retry_pending.store(false, Ordering::Relaxed);
                    self.start_attempt();
                }
            }
        }

        self.cancel_retry();
        self.attempt = None;
        self.fail_waiters(&BridgeError::BridgeDestroyed);
        self.close_link(CLOSE_NORMAL, "shutdown");
        self.shared.set_state(ConnectionState::Idle);
        debug!("connection driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.on_connect(reply),
            Command::Disconnect { reply } => {
                self.cancel_retry();
                self.attempt = None;
                self.fail_waiters(&BridgeError::NotConnected);
                self.close_link(CLOSE_NORMAL, "client disconnect");
                self.shared.set_state(ConnectionState::Idle);
                let _ = reply.send(());
            }
            Command::ForceReconnect { code, reason } => {
                if self.link.is_some() {
                    warn!(code, %reason, "forcing reconnect");
                    self.close_link(code, &reason);
                    self.shared.set_state(ConnectionState::Idle);
                    self.schedule_reconnect();
                }
            }
            Command::Shutdown => {}
        }
    }

    fn on_connect(&mut self, reply: Option<oneshot::Sender<Result<()>>>) {
        let state = *self.shared.state.read();
        match state {
            ConnectionState::Open => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
            ConnectionState::Connecting => {
                self.waiters.extend(reply);
                return;
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Error => {}
        }

        if self.shared.exhausted.swap(false, Ordering::Relaxed) {
            info!("explicit connect after exhausted retries, resetting attempts");
            self.attempts = 0;
        }
        self.cancel_retry();
        self.waiters.extend(reply);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        let transport = Arc::clone(&self.transport);
        let timeout = self.config.connect_timeout;
        self.shared.set_state(ConnectionState::Connecting);
        debug!(timeout_ms = timeout.as_millis() as u64, "opening transport");
        self.attempt = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, transport.open()).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::Connection(format!(
                    "connection timed out after {}ms",
                    timeout.as_millis()
                ))),
            }
        }));
    }

    fn on_attempt(&mut self, result: Result<TransportLink>) {
        match result {
            Ok(link) => {
                info!(link_id = %link.id, "connection open");
                *self.shared.writer.lock() = Some(link.outbound);
                *self.shared.link_id.write() = Some(link.id.clone());
                self.link = Some((link.id.clone(), link.inbound));
                self.attempts = 0;
                self.shared.set_state(ConnectionState::Open);
                counter!(CONNECTIONS_TOTAL).increment(1);
                self.shared
                    .emit(ConnectionEvent::Connected { link_id: link.id });
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(error) => {
                warn!(%error, attempt = self.attempts, "connect attempt failed");
                self.shared.set_state(ConnectionState::Error);
                self.shared.record_error();
                self.shared.emit(ConnectionEvent::Error {
                    error: error.clone(),
                });
                self.fail_waiters(&error);
                self.schedule_reconnect();
            }
        }
    }

    fn on_link_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Message(text)) => match Message::from_json(&text) {
                Ok(message) => {
                    self.shared.health.lock().record_received();
                    counter!(MESSAGES_RECEIVED_TOTAL).increment(1);
                    trace!(message_id = %message.id, kind = ?message.kind, "message received");
                    let _ = self.incoming.send(message);
                }
                Err(error) => {
                    warn!(%error, "dropping undecodable frame");
                    counter!(DECODE_FAILURES_TOTAL).increment(1);
                    self.shared.record_error();
                    self.shared.emit(ConnectionEvent::Error { error });
                }
            },
            Some(TransportEvent::Error(message)) => {
                warn!(error = %message, "transport error");
                self.shared.record_error();
                self.shared.emit(ConnectionEvent::Error {
                    error: BridgeError::Connection(message.clone()),
                });
                // The link is unusable; anything it reports after this is moot
                self.close_link(CLOSE_ABNORMAL, &message);
                self.shared.set_state(ConnectionState::Idle);
                self.schedule_reconnect();
            }
            Some(TransportEvent::Closed { code, reason }) => self.on_closed(code, reason),
            None => self.on_closed(CLOSE_ABNORMAL, "link dropped".into()),
        }
    }

    fn on_closed(&mut self, code: u16, reason: String) {
        let link_id = self.link.take().map(|(id, _)| id);
        *self.shared.writer.lock() = None;
        *self.shared.link_id.write() = None;
        self.shared.set_state(ConnectionState::Idle);
        info!(?link_id, code, %reason, "connection closed");
        self.shared
            .emit(ConnectionEvent::Disconnected { code, reason });
        if code != CLOSE_NORMAL {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let policy = self.config.policy;
        if !policy.allows(self.attempts) {
            warn!(attempts = self.attempts, "reconnect attempts exhausted");
            self.shared.exhausted.store(true, Ordering::Relaxed);
            self.shared.emit(ConnectionEvent::ReconnectExhausted {
                attempts: self.attempts,
            });
            return;
        }

        let delay = policy.delay_for(self.attempts);
        self.attempts += 1;
        self.shared
            .health
            .lock()
            .record_reconnect(chrono::Utc::now().timestamp_millis());
        counter!(RECONNECTS_TOTAL).increment(1);
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.shared.retry_pending.store(true, Ordering::Relaxed);
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
        self.shared.emit(ConnectionEvent::Reconnecting {
            attempt: self.attempts,
            delay,
        });
    }

    fn cancel_retry(&mut self) {
        self.reconnect = None;
        self.shared.retry_pending.store(false, Ordering::Relaxed);
    }

    fn close_link(&mut self, code: u16, reason: &str) {
        let Some((link_id, _)) = self.link.take() else {
            return;
        };
        self.shared.set_state(ConnectionState::Closing);
        *self.shared.link_id.write() = None;
        if let Some(writer) = self.shared.writer.lock().take() {
            let _ = writer.try_send(Frame::Close {
                code,
                reason: reason.to_owned(),
            });
        }
        info!(%link_id, code, reason, "connection closed locally");
        self.shared.emit(ConnectionEvent::Disconnected {
            code,
            reason: reason.to_owned(),
        });
    }

    fn fail_waiters(&mut self, error: &BridgeError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

async fn next_attempt(attempt: &mut Option<OpenFuture>) -> Result<TransportLink> {
    match attempt {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_link_event(
    link: &mut Option<(LinkId, mpsc::Receiver<TransportEvent>)>,
) -> Option<TransportEvent> {
    match link {
        Some((_, inbound)) => inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryPeer, MemoryTransport, OpenBehavior};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tether_core::MessageType;
    use tokio::time::Instant;

    struct Harness {
        manager: ConnectionManager,
        transport: Arc<MemoryTransport>,
        accepted: mpsc::UnboundedReceiver<MemoryPeer>,
        incoming: mpsc::UnboundedReceiver<Message>,
        events: broadcast::Receiver<ConnectionEvent>,
    }

    fn harness(config: ConnectionConfig) -> Harness {
        let (transport, accepted) = MemoryTransport::new();
        let transport = Arc::new(transport);
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let (manager, incoming) = ConnectionManager::new(dyn_transport, config);
        let events = manager.subscribe();
        Harness {
            manager,
            transport,
            accepted,
            incoming,
            events,
        }
    }

    fn config(timeout_ms: u64, max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            policy: ReconnectPolicy {
                base: Duration::from_millis(1000),
                cap: Duration::from_millis(30_000),
                max_attempts,
            },
            connect_timeout: Duration::from_millis(timeout_ms),
            event_capacity: 64,
        }
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<ConnectionEvent>,
        pred: impl Fn(&ConnectionEvent) -> bool,
    ) -> ConnectionEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_transport_times_out() {
        let mut h = harness(config(200, 10));
        h.transport.set_behavior(OpenBehavior::Hang);

        let start = Instant::now();
        let err = h.manager.connect().await.unwrap_err();
        assert_matches!(err, BridgeError::Connection(ref m) if m.contains("timed out"));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!h.manager.is_connected());
        assert_eq!(h.manager.state(), ConnectionState::Error);
        assert!(h.manager.is_retry_pending());
        assert_eq!(h.manager.metrics().errors_count, 1);

        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_and_is_idempotent() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let _peer = h.accepted.recv().await.unwrap();
        assert!(h.manager.is_connected());
        assert_matches!(
            h.events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        );

        h.manager.connect().await.unwrap();
        assert_eq!(h.transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_open_link() {
        let mut h = harness(config(1000, 10));
        let msg = Message::new(MessageType::Command, "go", json!({}), "local", "remote");
        assert_matches!(h.manager.send(&msg), Err(BridgeError::NotConnected));

        h.manager.connect().await.unwrap();
        let mut peer = h.accepted.recv().await.unwrap();
        h.manager.send(&msg).unwrap();
        assert_eq!(peer.recv_message().await.map(|m| m.id), Some(msg.id));
        assert_eq!(h.manager.metrics().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_are_decoded() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let peer = h.accepted.recv().await.unwrap();

        let msg = Message::new(MessageType::DataUpdate, "tick", json!(1), "remote", "local");
        peer.send(&msg).await.unwrap();
        assert_eq!(h.incoming.recv().await.map(|m| m.id), Some(msg.id));
        assert_eq!(h.manager.metrics().messages_received, 1);

        peer.send_text("{broken").await.unwrap();
        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Error { .. })
        })
        .await;
        assert_matches!(
            event,
            ConnectionEvent::Error {
                error: BridgeError::InvalidMessage(_)
            }
        );
        assert_eq!(h.manager.metrics().errors_count, 1);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_backs_off_then_doubles() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let peer = h.accepted.recv().await.unwrap();
        assert_eq!(h.manager.metrics().reconnect_count, 0);

        h.transport.set_behavior(OpenBehavior::Refuse);
        peer.close(CLOSE_ABNORMAL, "gone").await.unwrap();

        let first = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            first,
            ConnectionEvent::Reconnecting {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );

        let second = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Reconnecting { .. })
        })
        .await;
        assert_eq!(
            second,
            ConnectionEvent::Reconnecting {
                attempt: 2,
                delay: Duration::from_millis(2000)
            }
        );
        let metrics = h.manager.metrics();
        assert_eq!(metrics.reconnect_count, 2);
        assert!(metrics.last_reconnect_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_succeeds_after_backoff() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let peer = h.accepted.recv().await.unwrap();

        let start = Instant::now();
        peer.close(CLOSE_ABNORMAL, "gone").await.unwrap();
        let _second = h.accepted.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1000));
        let _ = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;
        assert!(h.manager.is_connected());
        assert_eq!(h.transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_close_does_not_reconnect() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let peer = h.accepted.recv().await.unwrap();

        peer.close(CLOSE_NORMAL, "bye").await.unwrap();
        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert_matches!(event, ConnectionEvent::Disconnected { code: 1000, .. });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert!(!h.manager.is_retry_pending());
        assert_eq!(h.manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_stops_retrying_until_explicit_connect() {
        let mut h = harness(config(1000, 2));
        h.transport.set_behavior(OpenBehavior::Refuse);
        assert!(h.manager.connect().await.is_err());

        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::ReconnectExhausted { .. })
        })
        .await;
        assert_eq!(event, ConnectionEvent::ReconnectExhausted { attempts: 2 });
        assert!(h.manager.is_exhausted());
        assert!(!h.manager.is_retry_pending());
        assert_eq!(h.transport.open_count(), 3);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.transport.open_count(), 3);

        h.transport.set_behavior(OpenBehavior::Accept);
        h.manager.connect().await.unwrap();
        assert!(!h.manager.is_exhausted());
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let h = harness(config(1000, 10));
        h.transport.set_behavior(OpenBehavior::Refuse);
        assert!(h.manager.connect().await.is_err());
        assert!(h.manager.is_retry_pending());

        h.manager.disconnect().await;
        assert!(!h.manager.is_retry_pending());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.open_count(), 1);
        assert_eq!(h.manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_writes_clean_close() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let mut peer = h.accepted.recv().await.unwrap();

        h.manager.disconnect().await;
        assert_eq!(
            peer.recv().await,
            Some(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "client disconnect".into()
            })
        );
        assert!(!h.manager.is_connected());
        assert!(!h.manager.is_retry_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_cycles_the_link() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let mut peer = h.accepted.recv().await.unwrap();

        h.manager.force_reconnect(4000, "heartbeat timeout");
        assert_matches!(peer.recv().await, Some(Frame::Close { code: 4000, .. }));
        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert_matches!(event, ConnectionEvent::Disconnected { code: 4000, .. });

        let _replacement = h.accepted.recv().await.unwrap();
        let _ = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;
        assert_eq!(h.manager.metrics().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_alone_reconnects() {
        let mut h = harness(config(1000, 10));
        h.manager.connect().await.unwrap();
        let mut peer = h.accepted.recv().await.unwrap();
        let first_link = h.manager.link_id();
        assert!(first_link.is_some());

        peer.fail("connection reset").await.unwrap();
        let event = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert_matches!(
            event,
            ConnectionEvent::Disconnected { code: CLOSE_ABNORMAL, ref reason } if reason == "connection reset"
        );
        assert_matches!(peer.recv().await, Some(Frame::Close { code: CLOSE_ABNORMAL, .. }));
        assert_eq!(h.manager.link_id(), None);
        assert!(h.manager.is_retry_pending());
        assert_eq!(h.manager.metrics().errors_count, 1);

        let _replacement = h.accepted.recv().await.unwrap();
        let _ = next_matching(&mut h.events, |e| {
            matches!(e, ConnectionEvent::Connected { .. })
        })
        .await;
        assert!(h.manager.is_connected());
        assert_ne!(h.manager.link_id(), first_link);
        assert_eq!(h.manager.metrics().reconnect_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_samples_drive_quality_events() {
        let mut h = harness(config(1000, 10));
        h.manager.record_latency(Duration::from_millis(150));
        assert_eq!(
            h.events.recv().await.unwrap(),
            ConnectionEvent::QualityChanged(QualityChange {
                previous: tether_core::ConnectionQuality::Excellent,
                current: tether_core::ConnectionQuality::Fair,
            })
        );
        h.manager.record_latency(Duration::from_millis(160));
        assert!(h.events.try_recv().is_err());
        assert!((h.manager.metrics().latency - 160.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_connect_callers() {
        let h = harness(config(1000, 10));
        h.manager.shutdown();
        tokio::task::yield_now().await;
        assert_matches!(h.manager.connect().await, Err(BridgeError::BridgeDestroyed));
    }
}
