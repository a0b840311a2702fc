//! The bridge facade.
//!
//! A [`Bridge`] owns one [`ConnectionManager`], one [`HeartbeatManager`] and
//! the pump that owns the [`MessageProcessor`](crate::MessageProcessor). It
//! wires them together with three background tasks:
//!
//! - **pump**: drains queues every tick and resolves requests
//! - **router**: turns connection events and heartbeat signals into
//!   [`BridgeEvent`]s and reacts to them (heartbeat start/stop, forced
//!   reconnect on heartbeat timeout)
//! - **supervisor** (optional, see
//!   [`establish_persistent_bridge`](Bridge::establish_persistent_bridge)):
//!   keeps the connection up and gives up when the peer is clearly absent
//!
//! There is no global instance; construct one per connection and hand it a
//! transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::constants::{
    BROADCAST_TARGET, CLOSE_HEARTBEAT_TIMEOUT, FULL_SYNC_ACTION, STATE_SYNC_ACTION,
};
use tether_core::{
    BridgeError, ConnectionMetrics, ConnectionQuality, Message, MessageDraft, MessageId,
    MessageType, Priority, Result,
};
use tether_settings::BridgeSettings;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState};
use crate::events::BridgeEvent;
use crate::heartbeat::{HeartbeatManager, HeartbeatSignal};
use crate::processor::{BufferStats, MessageProcessor, ProcessorConfig, Pump, PumpCommand};
use crate::transport::Transport;

#[derive(Debug, Default)]
struct Flags {
    destroyed: AtomicBool,
    ever_connected: AtomicBool,
    gave_up: AtomicBool,
}

struct Inner {
    settings: BridgeSettings,
    connection: ConnectionManager,
    heartbeat: Arc<HeartbeatManager>,
    pump_commands: mpsc::UnboundedSender<PumpCommand>,
    events: broadcast::Sender<BridgeEvent>,
    flags: Arc<Flags>,
    low_latency: Arc<AtomicBool>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<CancellationToken>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.heartbeat.stop();
        self.connection.shutdown();
    }
}

/// Persistent message bridge to one remote peer.
///
/// Cloning is cheap and every clone drives the same bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

impl Bridge {
    /// Build a bridge over `transport`. Nothing connects until
    /// [`connect`](Self::connect) or
    /// [`establish_persistent_bridge`](Self::establish_persistent_bridge).
    ///
    /// Fails with [`BridgeError::InvalidSettings`] when `settings` do not
    /// validate. Must be called from within a Tokio runtime.
    pub fn new(settings: BridgeSettings, transport: Arc<dyn Transport>) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| BridgeError::InvalidSettings(e.to_string()))?;
        let (connection, inbound) =
            ConnectionManager::new(transport, ConnectionConfig::from_settings(&settings));
        let connection_events = connection.subscribe();
        let (heartbeat, signals) = HeartbeatManager::from_settings(&settings);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let (pump_commands, commands) = mpsc::unbounded_channel();
        let flags = Arc::new(Flags::default());
        let low_latency = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let pump = Pump {
            processor: MessageProcessor::new(ProcessorConfig::from_settings(&settings)),
            commands,
            inbound,
            connection: connection.clone(),
            heartbeat: Arc::clone(&heartbeat),
            events: events.clone(),
            low_latency: Arc::clone(&low_latency),
            tick: settings.tick_interval(),
            cancel: cancel.clone(),
            last_link: None,
        };
        let pump = tokio::spawn(pump.run());

        let router = Router {
            connection: connection.clone(),
            heartbeat: Arc::clone(&heartbeat),
            events: events.clone(),
            flags: Arc::clone(&flags),
            cancel: cancel.clone(),
        };
        let _ = tokio::spawn(router.run(connection_events, signals));

        debug!(url = %settings.url, "bridge created");
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                connection,
                heartbeat,
                pump_commands,
                events,
                flags,
                low_latency,
                cancel,
                pump: Mutex::new(Some(pump)),
                supervisor: Mutex::new(None),
            }),
        })
    }

    /// Open the connection and wait until it is usable.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.inner.flags.gave_up.store(false, Ordering::Relaxed);
        self.inner.connection.connect().await
    }

    /// Close the connection cleanly and stop supervision and reconnects.
    pub async fn disconnect(&self) {
        if let Some(token) = self.inner.supervisor.lock().take() {
            token.cancel();
        }
        self.inner.heartbeat.stop();
        self.inner.connection.disconnect().await;
    }

    /// Queue a fire-and-forget message. Returns its ID.
    ///
    /// Succeeds while disconnected: the message is kept and redelivered once
    /// the connection reopens. Fails only once the bridge is destroyed.
    pub fn send_message(&self, draft: MessageDraft) -> Result<MessageId> {
        self.ensure_alive()?;
        let message = self.stamp(draft);
        let id = message.id.clone();
        self.submit(PumpCommand::Send(message))?;
        Ok(id)
    }

    /// Send a request and wait for its acknowledgment payload.
    ///
    /// `timeout` defaults to the configured message timeout.
    pub async fn send_with_response(
        &self,
        draft: MessageDraft,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_alive()?;
        let message = self.stamp(draft);
        let timeout = timeout.unwrap_or_else(|| self.inner.settings.message_timeout());
        let (reply, outcome) = oneshot::channel();
        self.submit(PumpCommand::Request {
            message,
            timeout: Some(timeout),
            reply,
        })?;
        let ack = outcome.await.map_err(|_| BridgeError::BridgeDestroyed)??;
        Ok(ack.payload)
    }

    /// Push application state to the peer (fire-and-forget).
    pub fn sync_state(&self, state: Value) -> Result<MessageId> {
        self.send_message(MessageDraft::new(MessageType::DataUpdate, STATE_SYNC_ACTION).payload(state))
    }

    /// Ask the peer to run `name` with `args` and wait for its answer.
    pub async fn send_remote_command(&self, name: &str, args: Value) -> Result<Value> {
        let draft = MessageDraft::new(MessageType::Command, name)
            .payload(args)
            .priority(Priority::High);
        self.send_with_response(draft, None).await
    }

    /// Ask the peer to resend its full state and wait for it.
    pub async fn request_full_sync(&self) -> Result<Value> {
        let draft =
            MessageDraft::new(MessageType::SyncRequest, FULL_SYNC_ACTION).priority(Priority::High);
        self.send_with_response(draft, None).await
    }

    /// Send a system event to every endpoint.
    pub fn broadcast_event(&self, name: &str, payload: Value) -> Result<MessageId> {
        self.send_message(
            MessageDraft::new(MessageType::SystemEvent, name)
                .payload(payload)
                .target(BROADCAST_TARGET),
        )
    }

    /// Acknowledge `request` with an explicit payload.
    pub fn respond(&self, request: &Message, payload: Value) -> Result<MessageId> {
        self.ensure_alive()?;
        let ack = request.acknowledgment(payload);
        let id = ack.id.clone();
        self.submit(PumpCommand::Send(ack))?;
        Ok(id)
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Current connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Connection metrics. Quality reads `poor` once supervision gave up.
    pub fn connection_metrics(&self) -> ConnectionMetrics {
        let mut metrics = self.inner.connection.metrics();
        if self.inner.flags.gave_up.load(Ordering::Relaxed) {
            metrics.connection_quality = ConnectionQuality::Poor;
        }
        metrics
    }

    /// Queue and correlation-map sizes.
    pub async fn buffer_stats(&self) -> Result<BufferStats> {
        let (reply, stats) = oneshot::channel();
        self.submit(PumpCommand::Stats(reply))?;
        stats.await.map_err(|_| BridgeError::BridgeDestroyed)
    }

    /// Subscribe to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.inner.events.subscribe()
    }

    /// Keep the connection up under supervision.
    ///
    /// Every supervise interval: reconnect when idle and nothing is
    /// scheduled; give up (and quiesce) when the peer never connected within
    /// the give-up window, when total reconnects reach their cap after a
    /// successful connection, or when the reconnect ceiling was hit.
    /// Calling it again while supervising is a no-op.
    pub fn establish_persistent_bridge(&self) {
        if self.inner.flags.destroyed.load(Ordering::Relaxed) {
            return;
        }
        let token = {
            let mut supervisor = self.inner.supervisor.lock();
            if supervisor.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = self.inner.cancel.child_token();
            *supervisor = Some(token.clone());
            token
        };
        self.inner.flags.gave_up.store(false, Ordering::Relaxed);

        let supervisor = Supervisor {
            connection: self.inner.connection.clone(),
            heartbeat: Arc::clone(&self.inner.heartbeat),
            events: self.inner.events.clone(),
            flags: Arc::clone(&self.inner.flags),
            period: self.inner.settings.supervise_interval(),
            give_up_window: self.inner.settings.give_up_window(),
            max_total_reconnects: self.inner.settings.max_total_reconnects,
            cancel: token,
        };
        info!("persistent bridge supervision started");
        let _ = tokio::spawn(supervisor.run());
    }

    /// Shorten the heartbeat interval and write `critical` messages as soon
    /// as they are submitted instead of on the next tick.
    pub fn enable_low_latency_mode(&self) {
        let interval = self.inner.settings.low_latency_heartbeat_interval();
        self.inner.low_latency.store(true, Ordering::Relaxed);
        self.inner.heartbeat.set_interval(interval);
        info!(heartbeat_ms = interval.as_millis() as u64, "low-latency mode enabled");
    }

    /// Whether low-latency mode is on.
    pub fn is_low_latency(&self) -> bool {
        self.inner.low_latency.load(Ordering::Relaxed)
    }

    /// Shut the bridge down.
    ///
    /// Stops every timer, rejects all pending requests with
    /// [`BridgeError::BridgeDestroyed`] and closes the transport. Later calls
    /// on any clone fail fast. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.flags.destroyed.swap(true, Ordering::Relaxed) {
            return;
        }
        info!("destroying bridge");
        self.inner.cancel.cancel();
        let pump = self.inner.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(error = %e, "pump task failed");
            }
        }
        self.inner.heartbeat.stop();
        self.inner.connection.shutdown();
        let _ = self.inner.events.send(BridgeEvent::Destroyed);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.flags.destroyed.load(Ordering::Relaxed) {
            Err(BridgeError::BridgeDestroyed)
        } else {
            Ok(())
        }
    }

    fn stamp(&self, draft: MessageDraft) -> Message {
        draft.into_message(
            &self.inner.settings.local_endpoint,
            &self.inner.settings.remote_endpoint,
        )
    }

    fn submit(&self, command: PumpCommand) -> Result<()> {
        self.inner
            .pump_commands
            .send(command)
            .map_err(|_| BridgeError::BridgeDestroyed)
    }
}

struct Router {
    connection: ConnectionManager,
    heartbeat: Arc<HeartbeatManager>,
    events: broadcast::Sender<BridgeEvent>,
    flags: Arc<Flags>,
    cancel: CancellationToken,
}

impl Router {
    async fn run(
        self,
        mut connection_events: broadcast::Receiver<ConnectionEvent>,
        mut signals: mpsc::UnboundedReceiver<HeartbeatSignal>,
    ) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = connection_events.recv() => match event {
                    Ok(event) => self.on_connection_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(signal) = signals.recv() => self.on_heartbeat_signal(signal),
            }
        }
    }

    fn on_connection_event(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected { .. } => {
                self.flags.ever_connected.store(true, Ordering::Relaxed);
                self.heartbeat.start();
            }
            ConnectionEvent::Disconnected { .. } => self.heartbeat.stop(),
            _ => {}
        }
        let _ = self.events.send(event.into());
    }

    fn on_heartbeat_signal(&self, signal: HeartbeatSignal) {
        match signal {
            HeartbeatSignal::Ping(ping) => {
                if let Err(error) = self.connection.send(&ping) {
                    debug!(%error, "heartbeat ping not sent");
                }
            }
            HeartbeatSignal::Timeout { missed } => {
                let _ = self.events.send(BridgeEvent::HeartbeatTimeout { missed });
                self.connection
                    .force_reconnect(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
            }
        }
    }
}

struct Supervisor {
    connection: ConnectionManager,
    heartbeat: Arc<HeartbeatManager>,
    events: broadcast::Sender<BridgeEvent>,
    flags: Arc<Flags>,
    period: Duration,
    give_up_window: Duration,
    max_total_reconnects: u32,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Some(reason) = self.give_up_reason(started) {
                warn!(%reason, "giving up on peer");
                self.flags.gave_up.store(true, Ordering::Relaxed);
                self.heartbeat.stop();
                self.connection.disconnect().await;
                let _ = self.events.send(BridgeEvent::GaveUp { reason });
                self.cancel.cancel();
                return;
            }

            let idle = matches!(
                self.connection.state(),
                ConnectionState::Idle | ConnectionState::Error
            );
            if idle && !self.connection.is_retry_pending() {
                debug!("supervisor reconnecting idle bridge");
                self.connection.request_connect();
            }
        }
    }

    fn give_up_reason(&self, started: Instant) -> Option<String> {
        if self.flags.ever_connected.load(Ordering::Relaxed) {
            let reconnects = self.connection.metrics().reconnect_count;
            if reconnects >= self.max_total_reconnects {
                return Some(format!("reconnect limit reached ({reconnects})"));
            }
        } else if started.elapsed() >= self.give_up_window {
            return Some(format!(
                "never connected within {}ms",
                self.give_up_window.as_millis()
            ));
        }
        self.connection
            .is_exhausted()
            .then(|| "reconnect attempts exhausted".to_owned())
    }
}
