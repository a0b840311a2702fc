//! Events published to bridge subscribers.

use serde::Serialize;
use tether_core::{ConnectionQuality, LinkId, Message, MessageId};

use crate::connection::ConnectionEvent;

/// Everything a bridge subscriber can observe.
///
/// Serialized with an `event` tag so the stream can be written out as JSON
/// lines.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    /// The transport opened.
    Connected {
        /// The new link.
        link_id: LinkId,
    },
    /// The transport closed.
    Disconnected {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A reconnect was scheduled.
    Reconnecting {
        /// One-based attempt index.
        attempt: u32,
        /// Delay before the attempt.
        delay_ms: u64,
    },
    /// The consecutive-attempt ceiling was reached.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// A recoverable error, surfaced for observability.
    Error {
        /// Error classification.
        kind: &'static str,
        /// Human-readable description.
        message: String,
    },
    /// The connection quality bucket changed.
    QualityChanged {
        /// Bucket before.
        previous: ConnectionQuality,
        /// Bucket after.
        current: ConnectionQuality,
    },
    /// An application message arrived.
    Message {
        /// The message.
        message: Message,
    },
    /// The peer stopped answering heartbeats.
    HeartbeatTimeout {
        /// Consecutive misses.
        missed: u32,
    },
    /// A correlated request expired without acknowledgment.
    RequestTimedOut {
        /// The request's correlation key.
        correlation_id: MessageId,
        /// The request's action.
        action: String,
    },
    /// The persistent-bridge supervisor stopped reconnecting.
    GaveUp {
        /// Why.
        reason: String,
    },
    /// The bridge was destroyed.
    Destroyed,
}

impl From<ConnectionEvent> for BridgeEvent {
    fn from(event: ConnectionEvent) -> Self {
        match event {
            ConnectionEvent::Connected { link_id } => Self::Connected { link_id },
            ConnectionEvent::Disconnected { code, reason } => Self::Disconnected { code, reason },
            ConnectionEvent::Error { error } => Self::Error {
                kind: error.error_kind(),
                message: error.to_string(),
            },
            ConnectionEvent::Reconnecting { attempt, delay } => Self::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
            ConnectionEvent::ReconnectExhausted { attempts } => {
                Self::ReconnectExhausted { attempts }
            }
            ConnectionEvent::QualityChanged(change) => Self::QualityChanged {
                previous: change.previous,
                current: change.current,
            },
        }
    }
}
