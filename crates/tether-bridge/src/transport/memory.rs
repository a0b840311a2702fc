//! In-process transport.
//!
//! Every accepted `open` hands the far end of the link to the owner of the
//! transport as a [`MemoryPeer`], so both peers can live in one process.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::{BridgeError, LinkId, Message, Result};
use tokio::sync::mpsc;

use super::{Frame, Transport, TransportEvent, TransportLink};

/// How [`MemoryTransport::open`] behaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open succeeds and a peer is handed out.
    #[default]
    Accept,
    /// Open fails immediately with a connection error.
    Refuse,
    /// Open never resolves.
    Hang,
}

/// The remote end of an in-process link.
#[derive(Debug)]
pub struct MemoryPeer {
    /// ID of the link this peer serves.
    pub link_id: LinkId,
    events: mpsc::Sender<TransportEvent>,
    frames: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    /// Deliver a message to the bridge side.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_text(message.to_json()?).await
    }

    /// Deliver a raw text frame to the bridge side.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.emit(TransportEvent::Message(text.into())).await
    }

    /// Report a transport error to the bridge side.
    pub async fn fail(&self, error: impl Into<String>) -> Result<()> {
        self.emit(TransportEvent::Error(error.into())).await
    }

    /// Close the link with `code`, consuming the peer.
    pub async fn close(self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
        .await
    }

    /// Next frame written by the bridge side; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Next decodable message written by the bridge side. Returns `None` on
    /// a close frame or when the link is gone.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            match self.frames.recv().await? {
                Frame::Text(text) => {
                    if let Ok(message) = Message::from_json(&text) {
                        return Some(message);
                    }
                }
                Frame::Close { .. } => return None,
            }
        }
    }

    async fn emit(&self, event: TransportEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| BridgeError::Connection("link dropped".into()))
    }
}

/// Transport whose links terminate in this process.
#[derive(Debug)]
pub struct MemoryTransport {
    behavior: Mutex<OpenBehavior>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
    opens: AtomicU32,
}

impl MemoryTransport {
    /// Create a transport and the receiver of its accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let transport = Self {
            behavior: Mutex::new(OpenBehavior::Accept),
            peers,
            opens: AtomicU32::new(0),
        };
        (transport, accepted)
    }

    /// Change how subsequent opens behave.
    pub fn set_behavior(&self, behavior: OpenBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportLink> {
        let _ = self.opens.fetch_add(1, Ordering::Relaxed);
        let behavior = *self.behavior.lock();
        match behavior {
            OpenBehavior::Refuse => Err(BridgeError::Connection("connection refused".into())),
            OpenBehavior::Hang => std::future::pending().await,
            OpenBehavior::Accept => {
                let (link, events, frames) = TransportLink::channel();
                let peer = MemoryPeer {
                    link_id: link.id.clone(),
                    events,
                    frames,
                };
                self.peers
                    .send(peer)
                    .map_err(|_| BridgeError::Connection("no acceptor".into()))?;
                Ok(link)
            }
        }
    }
}
