//! Message queues, request correlation and the pump.
//!
//! [`MessageProcessor`] is plain synchronous state: two FIFO queues, the
//! correlation map of in-flight requests and a bounded list of messages that
//! failed delivery. It is driven by the pump task, which is its sole owner,
//! so none of it needs a lock. Transport callbacks only enqueue.
//!
//! Each [`tick`](MessageProcessor::tick):
//! 1. Hands every outgoing message to the [`Outbound`] in enqueue order
//! 2. Dispatches every incoming message in arrival order
//! 3. Rejects requests older than their timeout
//!
//! A rejected request is also pulled from the queues, so the peer never sees
//! a request its caller has already been told failed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use tether_core::{BridgeError, LinkId, Message, MessageId, MessageType, Priority, Result};
use tether_settings::BridgeSettings;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::events::BridgeEvent;
use crate::heartbeat::HeartbeatManager;
use crate::metrics::{PENDING_REQUESTS, REQUEST_TIMEOUTS_TOTAL, SEND_FAILURES_TOTAL};

/// Where the pump hands outgoing messages.
pub trait Outbound {
    /// Write one message.
    fn deliver(&self, message: &Message) -> Result<()>;
}

impl Outbound for ConnectionManager {
    fn deliver(&self, message: &Message) -> Result<()> {
        self.send(message)
    }
}

/// Something a tick did that the owner may care about.
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessorEvent {
    /// An application message to forward.
    Inbound(Message),
    /// A heartbeat ping or pong.
    Heartbeat(Message),
    /// A pending request was acknowledged.
    Resolved {
        /// Correlation key of the request.
        correlation_id: MessageId,
    },
    /// A pending request timed out.
    Expired {
        /// Correlation key of the request.
        correlation_id: MessageId,
        /// Action of the request.
        action: String,
    },
    /// An outgoing message could not be handed to the transport.
    DeliveryFailed {
        /// The message.
        message_id: MessageId,
        /// Why.
        error: BridgeError,
    },
}

/// Queue and correlation-map sizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    /// Messages waiting to be written.
    pub outgoing: usize,
    /// Messages waiting to be dispatched.
    pub incoming: usize,
    /// Requests awaiting acknowledgment.
    pub pending: usize,
    /// Messages kept for redelivery.
    pub failed: usize,
}

/// Processor parameters.
#[derive(Clone, Copy, Debug)]
pub struct ProcessorConfig {
    /// Acknowledge inbound messages that request a response.
    pub auto_acknowledge: bool,
    /// Timeout for requests registered without one. Also how long a failed
    /// acknowledgment stays worth redelivering.
    pub sweep_timeout: Duration,
    /// Capacity of the failed list; the oldest entry is dropped when full.
    pub failed_capacity: usize,
}

impl ProcessorConfig {
    /// Derive from bridge settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            auto_acknowledge: settings.auto_acknowledge,
            sweep_timeout: settings.pending_sweep_timeout(),
            failed_capacity: settings.failed_queue_capacity,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_settings(&BridgeSettings::default())
    }
}

struct PendingRequest {
    action: String,
    reply: oneshot::Sender<Result<Message>>,
    sent_at: Instant,
    timeout: Duration,
}

struct FailedMessage {
    message: Message,
    failed_at: Instant,
}

/// Queues plus the correlation map.
pub struct MessageProcessor {
    outgoing: VecDeque<Message>,
    incoming: VecDeque<Message>,
    pending: HashMap<MessageId, PendingRequest>,
    failed: VecDeque<FailedMessage>,
    config: ProcessorConfig,
}

impl MessageProcessor {
    /// Create an empty processor.
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            pending: HashMap::new(),
            failed: VecDeque::new(),
            config,
        }
    }

    /// Append to the outgoing queue.
    pub fn queue_outgoing(&mut self, message: Message) {
        self.outgoing.push_back(message);
    }

    /// Append to the incoming queue.
    pub fn queue_incoming(&mut self, message: Message) {
        self.incoming.push_back(message);
    }

    /// Register `message` as a correlated request and queue it.
    ///
    /// The message is marked `requiresResponse` and correlated under its own
    /// ID. `reply` receives the acknowledgment, a [`BridgeError::Timeout`]
    /// once `timeout` (or the sweep default) elapses, or the error passed to
    /// [`reject_all`](Self::reject_all).
    pub fn register_request(
        &mut self,
        mut message: Message,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Message>>,
        now: Instant,
    ) {
        message.requires_response = true;
        message.correlation_id = Some(message.id.clone());
        let timeout = timeout.unwrap_or(self.config.sweep_timeout);
        trace!(message_id = %message.id, timeout_ms = timeout.as_millis() as u64, "request registered");

        let _ = self.pending.insert(
            message.id.clone(),
            PendingRequest {
                action: message.action.clone(),
                reply,
                sent_at: now,
                timeout,
            },
        );
        gauge!(PENDING_REQUESTS).set(self.pending.len() as f64);
        self.queue_outgoing(message);
    }

    /// Run one pump cycle at `now`.
    pub fn tick(&mut self, now: Instant, outbound: &dyn Outbound) -> Vec<ProcessorEvent> {
        let mut events = Vec::new();

        while let Some(message) = self.outgoing.pop_front() {
            if let Some(event) = self.deliver_now(message, outbound, now) {
                events.push(event);
            }
        }

        while let Some(message) = self.incoming.pop_front() {
            events.push(self.process_incoming_message(message));
        }

        events.extend(self.sweep_expired(now));
        events
    }

    /// Write `message` immediately, bypassing the queue. A failed message is
    /// kept for redelivery and reported.
    pub fn deliver_now(
        &mut self,
        message: Message,
        outbound: &dyn Outbound,
        now: Instant,
    ) -> Option<ProcessorEvent> {
        match outbound.deliver(&message) {
            Ok(()) => None,
            Err(error) => {
                debug!(message_id = %message.id, %error, "delivery failed");
                counter!(SEND_FAILURES_TOTAL, "error_kind" => error.error_kind()).increment(1);
                let event = ProcessorEvent::DeliveryFailed {
                    message_id: message.id.clone(),
                    error,
                };
                self.keep_failed(message, now);
                Some(event)
            }
        }
    }

    /// Dispatch one inbound message.
    ///
    /// An acknowledgment matching a pending request resolves it. Heartbeats
    /// are handed back for the heartbeat manager. Everything else is
    /// forwarded, and acknowledged when it asks for a response and
    /// auto-acknowledgment is on.
    pub fn process_incoming_message(&mut self, message: Message) -> ProcessorEvent {
        match message.kind {
            MessageType::Acknowledgment => {
                let pending = message
                    .correlation_id
                    .as_ref()
                    .and_then(|id| self.pending.remove_entry(id));
                match pending {
                    Some((correlation_id, request)) => {
                        gauge!(PENDING_REQUESTS).set(self.pending.len() as f64);
                        trace!(%correlation_id, "request acknowledged");
                        // Receiver may be gone if the caller stopped waiting
                        let _ = request.reply.send(Ok(message));
                        ProcessorEvent::Resolved { correlation_id }
                    }
                    None => {
                        trace!(message_id = %message.id, "uncorrelated acknowledgment");
                        ProcessorEvent::Inbound(message)
                    }
                }
            }
            MessageType::Heartbeat => ProcessorEvent::Heartbeat(message),
            _ => {
                if message.requires_response && self.config.auto_acknowledge {
                    self.queue_outgoing(message.acknowledgment(Value::Null));
                }
                ProcessorEvent::Inbound(message)
            }
        }
    }

    /// Reject and remove every request older than its timeout.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<ProcessorEvent> {
        let mut expired: Vec<(MessageId, Instant)> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.sent_at) >= request.timeout)
            .map(|(id, request)| (id.clone(), request.sent_at))
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }
        expired.sort_by_key(|(_, sent_at)| *sent_at);

        let mut events = Vec::with_capacity(expired.len());
        for (id, _) in expired {
            let Some((correlation_id, request)) = self.pending.remove_entry(&id) else {
                continue;
            };
            self.discard_request(&correlation_id);
            warn!(%correlation_id, action = %request.action, timeout_ms = request.timeout.as_millis() as u64, "request timed out");
            counter!(REQUEST_TIMEOUTS_TOTAL).increment(1);
            let _ = request.reply.send(Err(BridgeError::Timeout(request.timeout)));
            events.push(ProcessorEvent::Expired {
                correlation_id,
                action: request.action,
            });
        }
        gauge!(PENDING_REQUESTS).set(self.pending.len() as f64);
        events
    }

    /// Move the failed list back to the front of the outgoing queue, oldest
    /// first. Returns how many were requeued.
    ///
    /// Acknowledgments that failed at least a sweep timeout before `now` are
    /// dropped instead: their requester has stopped waiting.
    pub fn requeue_failed(&mut self, now: Instant) -> usize {
        let mut count = 0;
        while let Some(FailedMessage { message, failed_at }) = self.failed.pop_back() {
            if message.kind == MessageType::Acknowledgment
                && now.saturating_duration_since(failed_at) >= self.config.sweep_timeout
            {
                debug!(message_id = %message.id, "dropping stale acknowledgment");
                continue;
            }
            self.outgoing.push_front(message);
            count += 1;
        }
        if count > 0 {
            debug!(count, "requeued failed messages");
        }
        count
    }

    /// Reject every pending request with `error`. Returns how many.
    pub fn reject_all(&mut self, error: &BridgeError) -> usize {
        let rejected: Vec<_> = self.pending.drain().collect();
        let count = rejected.len();
        for (correlation_id, request) in rejected {
            self.discard_request(&correlation_id);
            let _ = request.reply.send(Err(error.clone()));
        }
        gauge!(PENDING_REQUESTS).set(0.0);
        count
    }

    /// Whether a request with this correlation key is awaiting acknowledgment.
    pub fn is_pending(&self, correlation_id: &MessageId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Current sizes.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            outgoing: self.outgoing.len(),
            incoming: self.incoming.len(),
            pending: self.pending.len(),
            failed: self.failed.len(),
        }
    }

    fn keep_failed(&mut self, message: Message, now: Instant) {
        if self.config.failed_capacity == 0 {
            return;
        }
        if self.failed.len() >= self.config.failed_capacity {
            if let Some(dropped) = self.failed.pop_front() {
                warn!(message_id = %dropped.message.id, "failed list full, dropping oldest");
            }
        }
        self.failed.push_back(FailedMessage {
            message,
            failed_at: now,
        });
    }

    /// Remove the request with this ID from both queues.
    fn discard_request(&mut self, id: &MessageId) {
        let is_request = |m: &Message| m.requires_response && m.id == *id;
        self.outgoing.retain(|m| !is_request(m));
        self.failed.retain(|f| !is_request(&f.message));
    }
}

/// Requests from the bridge to its pump.
pub(crate) enum PumpCommand {
    /// Fire-and-forget.
    Send(Message),
    /// Correlated request.
    Request {
        message: Message,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Message>>,
    },
    /// Report buffer sizes.
    Stats(oneshot::Sender<BufferStats>),
}

/// The pump task: sole owner of a [`MessageProcessor`].
pub(crate) struct Pump {
    pub(crate) processor: MessageProcessor,
    pub(crate) commands: mpsc::UnboundedReceiver<PumpCommand>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Message>,
    pub(crate) connection: ConnectionManager,
    pub(crate) heartbeat: Arc<HeartbeatManager>,
    pub(crate) events: broadcast::Sender<BridgeEvent>,
    pub(crate) low_latency: Arc<AtomicBool>,
    pub(crate) tick: Duration,
    pub(crate) cancel: CancellationToken,
    /// Link the failed list was last requeued for.
    pub(crate) last_link: Option<LinkId>,
}

impl Pump {
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                message = self.inbound.recv(), if inbound_open => match message {
                    Some(message) => self.processor.queue_incoming(message),
                    None => inbound_open = false,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.requeue_on_new_link(now);
                    let events = self.processor.tick(now, &self.connection);
                    self.dispatch(events);
                }
            }
        }

        let rejected = self.processor.reject_all(&BridgeError::BridgeDestroyed);
        debug!(rejected, "pump stopped");
    }

    fn on_command(&mut self, command: PumpCommand) {
        match command {
            PumpCommand::Send(message) => {
                if message.priority == Priority::Critical && self.low_latency.load(Ordering::Relaxed)
                {
                    let now = Instant::now();
                    self.requeue_on_new_link(now);
                    let event = self.processor.deliver_now(message, &self.connection, now);
                    self.dispatch(event.into_iter().collect());
                } else {
                    self.processor.queue_outgoing(message);
                }
            }
            PumpCommand::Request {
                message,
                timeout,
                reply,
            } => {
                self.processor
                    .register_request(message, timeout, reply, Instant::now());
            }
            PumpCommand::Stats(reply) => {
                let _ = reply.send(self.processor.stats());
            }
        }
    }

    /// Put earlier failures back in front of anything queued since, once per
    /// link.
    fn requeue_on_new_link(&mut self, now: Instant) {
        let link = self.connection.link_id();
        if link.is_some() && link != self.last_link {
            let _ = self.processor.requeue_failed(now);
            self.last_link = link;
        }
    }

    fn dispatch(&self, events: Vec<ProcessorEvent>) {
        for event in events {
            match event {
                ProcessorEvent::Inbound(message) => {
                    let _ = self.events.send(BridgeEvent::Message { message });
                }
                ProcessorEvent::Heartbeat(message) => self.on_heartbeat(&message),
                ProcessorEvent::Resolved { .. } | ProcessorEvent::DeliveryFailed { .. } => {}
                ProcessorEvent::Expired {
                    correlation_id,
                    action,
                } => {
                    let _ = self.events.send(BridgeEvent::RequestTimedOut {
                        correlation_id,
                        action,
                    });
                }
            }
        }
    }

    fn on_heartbeat(&self, message: &Message) {
        if message.is_ping() {
            // Stale pongs are useless, so they bypass the failed list
            if let Err(error) = self.connection.send(&message.pong()) {
                trace!(%error, "pong not sent");
            }
        } else if message.is_pong() {
            if let Some(latency) = self
                .heartbeat
                .handle_heartbeat_response(message, Instant::now())
            {
                self.connection.record_latency(latency);
            }
        }
    }
}
