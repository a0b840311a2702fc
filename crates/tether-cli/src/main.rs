//! # tether
//!
//! Command-line front end for the message bridge: listen for events, send
//! messages and requests, or run a development peer to talk to.

#![deny(unsafe_code)]

mod peer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tether_bridge::{Bridge, BridgeEvent, WebSocketTransport};
use tether_core::{MessageDraft, MessageType, Priority};
use tether_settings::BridgeSettings;

/// Real-time message bridge client.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Real-time message bridge client")]
struct Cli {
    /// Peer URL (overrides settings).
    #[arg(long, global = true)]
    url: Option<String>,

    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stay connected and print bridge events as JSON lines until Ctrl-C.
    Listen,
    /// Send one message.
    Send {
        /// Message action.
        #[arg(long)]
        action: String,
        /// JSON payload.
        #[arg(long, default_value = "null")]
        payload: String,
        /// Message type (`data-update`, `command`, `system-event`, ...).
        #[arg(long, default_value = "command")]
        kind: String,
        /// Priority (`low`, `medium`, `high`, `critical`).
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Wait for the acknowledgment and print its payload.
        #[arg(long)]
        wait: bool,
    },
    /// Push a state snapshot.
    Sync {
        /// JSON state.
        #[arg(long)]
        state: String,
    },
    /// Run a remote command and print its result.
    Command {
        /// Command name.
        name: String,
        /// JSON arguments.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Ask the peer for its full state.
    Resync,
    /// Run a development peer that answers pings and acknowledges requests.
    Peer {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: String,
    },
}

fn load_settings(args: &Cli) -> Result<BridgeSettings> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(url) = &args.url {
        settings.url.clone_from(url);
        settings.validate().context("Invalid --url")?;
    }
    Ok(settings)
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{label} is not valid JSON"))
}

fn parse_enum<T: serde::de::DeserializeOwned>(label: &str, raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_owned()))
        .with_context(|| format!("unknown {label}: {raw}"))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn connected_bridge(settings: BridgeSettings) -> Result<Bridge> {
    let transport = Arc::new(WebSocketTransport::from_settings(&settings));
    let url = settings.url.clone();
    let bridge = Bridge::new(settings, transport)?;
    bridge
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    Ok(bridge)
}

async fn listen(settings: BridgeSettings) -> Result<()> {
    let transport = Arc::new(WebSocketTransport::from_settings(&settings));
    let bridge = Bridge::new(settings, transport)?;
    let mut events = bridge.subscribe();
    bridge.establish_persistent_bridge();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_json(&event)?;
                    if matches!(event, BridgeEvent::GaveUp { .. }) {
                        bridge.destroy().await;
                        bail!("gave up connecting");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    bridge.destroy().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    if args.json_logs {
        tether_core::logging::init_json_subscriber(&args.log_level);
    } else {
        tether_core::logging::init_subscriber(&args.log_level);
    }

    if let Command::Peer { bind } = &args.command {
        return peer::run(bind).await;
    }

    let settings = load_settings(&args)?;
    match args.command {
        Command::Listen => listen(settings).await,
        Command::Send {
            action,
            payload,
            kind,
            priority,
            wait,
        } => {
            let kind: MessageType = parse_enum("message type", &kind)?;
            let priority: Priority = parse_enum("priority", &priority)?;
            let draft = MessageDraft::new(kind, action)
                .payload(parse_json("payload", &payload)?)
                .priority(priority);
            let bridge = connected_bridge(settings).await?;
            if wait {
                let ack = bridge
                    .send_with_response(draft, None)
                    .await
                    .context("Request failed")?;
                print_json(&ack)?;
            } else {
                let id = bridge.send_message(draft)?;
                println!("{id}");
                // Let the pump flush before tearing down
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            bridge.destroy().await;
            Ok(())
        }
        Command::Sync { state } => {
            let state = parse_json("state", &state)?;
            let bridge = connected_bridge(settings).await?;
            let id = bridge.sync_state(state)?;
            println!("{id}");
            tokio::time::sleep(Duration::from_millis(100)).await;
            bridge.destroy().await;
            Ok(())
        }
        Command::Command { name, args } => {
            let args = parse_json("args", &args)?;
            let bridge = connected_bridge(settings).await?;
            let result = bridge.send_remote_command(&name, args).await;
            bridge.destroy().await;
            print_json(&result.with_context(|| format!("Command {name} failed"))?)
        }
        Command::Resync => {
            let bridge = connected_bridge(settings).await?;
            let result = bridge.request_full_sync().await;
            bridge.destroy().await;
            print_json(&result.context("Full sync failed")?)
        }
        Command::Peer { .. } => Ok(()),
    }
}
