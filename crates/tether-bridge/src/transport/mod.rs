//! Transport boundary.
//!
//! A [`Transport`] opens one full-duplex, ordered text stream at a time and
//! hands back a [`TransportLink`]: a sender for outbound [`Frame`]s and a
//! receiver of [`TransportEvent`]s. The connection manager never touches a
//! socket directly.
//!
//! A link whose inbound channel closes without a [`TransportEvent::Closed`]
//! counts as an abnormal close (1006). So does a [`TransportEvent::Error`]:
//! the manager drops the link on the first error and reconnects.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tether_core::{LinkId, Result};
use tokio::sync::mpsc;

/// Buffer size for both directions of a link.
pub const LINK_BUFFER: usize = 256;

/// A frame written to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// JSON-encoded message.
    Text(String),
    /// Close the stream with a status code.
    Close {
        /// Close status code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Something the transport observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame arrived.
    Message(String),
    /// The stream closed.
    Closed {
        /// Close status code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
    /// The stream failed. Ends the link; nothing after it is read.
    Error(String),
}

/// An open stream.
#[derive(Debug)]
pub struct TransportLink {
    /// Identifies this link in logs.
    pub id: LinkId,
    /// Frames to write.
    pub outbound: mpsc::Sender<Frame>,
    /// Events observed on the stream.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportLink {
    /// Create a link with a fresh ID and bounded channels, returning the far
    /// ends (`inbound` sender, `outbound` receiver) for the transport's tasks.
    pub fn channel() -> (Self, mpsc::Sender<TransportEvent>, mpsc::Receiver<Frame>) {
        let (outbound, frames) = mpsc::channel(LINK_BUFFER);
        let (events, inbound) = mpsc::channel(LINK_BUFFER);
        let link = Self {
            id: LinkId::new(),
            outbound,
            inbound,
        };
        (link, events, frames)
    }
}

/// Opens links to the remote peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link. Resolves once the stream is usable.
    ///
    /// May never resolve; callers bound it with a timeout.
    async fn open(&self) -> Result<TransportLink>;
}
