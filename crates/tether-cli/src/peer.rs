//! Development peer: a WebSocket server that speaks the bridge protocol well
//! enough to exercise a client.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tether_core::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Accept connections on `bind` until Ctrl-C.
pub async fn run(bind: &str) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "peer listening");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("Failed to accept")?;
                let _ = tokio::spawn(async move {
                    if let Err(e) = serve(stream).await {
                        warn!(%addr, error = %e, "peer connection failed");
                    }
                });
            }
        }
    }
}

/// Answer `message`: pings get a pong, requests an echo acknowledgment.
fn reply_to(message: &Message) -> Option<Message> {
    if message.is_ping() {
        Some(message.pong())
    } else if message.requires_response {
        Some(message.acknowledgment(json!({
            "action": message.action,
            "payload": message.payload,
        })))
    } else {
        None
    }
}

async fn serve(stream: TcpStream) -> Result<()> {
    let ws = accept_async(stream).await.context("WebSocket handshake")?;
    info!("client connected");
    let (mut tx, mut rx) = ws.split();

    while let Some(frame) = rx.next().await {
        let text = match frame? {
            WsMessage::Text(text) => text,
            WsMessage::Close(frame) => {
                info!(?frame, "client closed");
                break;
            }
            _ => continue,
        };
        let message = match Message::from_json(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable frame");
                continue;
            }
        };
        debug!(message_id = %message.id, action = %message.action, "received");
        if !message.is_ping() && !message.is_pong() {
            println!("{}", text.as_str());
        }
        if let Some(reply) = reply_to(&message) {
            tx.send(WsMessage::text(reply.to_json()?)).await?;
        }
    }
    Ok(())
}
