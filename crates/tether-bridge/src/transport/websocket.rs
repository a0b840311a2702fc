//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_core::constants::{CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use tether_core::{BridgeError, Result};
use tether_settings::BridgeSettings;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::{Frame, Transport, TransportEvent, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side WebSocket transport. Each `open` dials `url` afresh.
#[derive(Clone, Debug)]
pub struct WebSocketTransport {
    url: String,
    compression: bool,
}

impl WebSocketTransport {
    /// Transport dialing `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            compression: false,
        }
    }

    /// Transport configured from bridge settings.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            url: settings.url.clone(),
            compression: settings.enable_compression,
        }
    }

    /// The URL dialed by `open`.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink> {
        if self.compression {
            // permessage-deflate is not negotiated by the client stack
            debug!(url = %self.url, "compression requested, sending uncompressed frames");
        }

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connection(format!("websocket connect: {e}")))?;

        let (link, events, frames) = TransportLink::channel();
        info!(url = %self.url, link_id = %link.id, "websocket open");
        let _ = tokio::spawn(link_loop(ws, frames, events));
        Ok(link)
    }
}

/// Pump frames between the socket and the link channels until either side
/// goes away. Always ends by reporting a close.
async fn link_loop(
    ws: WsStream,
    mut frames: mpsc::Receiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (code, reason) = loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    // Link dropped by its owner
                    let _ = ws_tx.close().await;
                    return;
                };
                match frame {
                    Frame::Text(text) => {
                        if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                            let _ = events.send(TransportEvent::Error(e.to_string())).await;
                            break (CLOSE_ABNORMAL, e.to_string());
                        }
                    }
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        let _ = ws_tx.send(WsMessage::Close(Some(close))).await;
                        let _ = ws_tx.close().await;
                        break (code, reason);
                    }
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if events.send(TransportEvent::Message(text.as_str().to_owned())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if events.send(TransportEvent::Message(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        break frame.map_or_else(
                            || (CLOSE_NO_STATUS, String::new()),
                            |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                        );
                    }
                    // Ping/Pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string())).await;
                        break (CLOSE_ABNORMAL, e.to_string());
                    }
                    None => break (CLOSE_ABNORMAL, "stream ended".to_owned()),
                }
            }
        }
    };

    debug!(code, %reason, "websocket closed");
    let _ = events.send(TransportEvent::Closed { code, reason }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn from_settings_carries_url() {
        let settings = BridgeSettings {
            url: "ws://10.1.1.1:9000".into(),
            enable_compression: true,
            ..BridgeSettings::default()
        };
        let transport = WebSocketTransport::from_settings(&settings);
        assert_eq!(transport.url(), "ws://10.1.1.1:9000");
        assert!(transport.compression);
    }

    #[tokio::test]
    async fn open_refused_is_connection_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new(format!("ws://{addr}"));
        assert_matches!(transport.open().await, Err(BridgeError::Connection(_)));
    }

    #[tokio::test]
    async fn invalid_url_is_connection_error() {
        let transport = WebSocketTransport::new("not a url");
        assert_matches!(transport.open().await, Err(BridgeError::Connection(_)));
    }
}
