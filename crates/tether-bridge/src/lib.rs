//! # tether-bridge
//!
//! A persistent, full-duplex message bridge between two application peers.
//!
//! - **Transport**: [`Transport`] boundary with WebSocket and in-memory
//!   implementations
//! - **Connection**: [`ConnectionManager`] state machine with exponential
//!   reconnect backoff and connection-quality tracking
//! - **Heartbeat**: [`HeartbeatManager`] liveness probing independent of
//!   application traffic
//! - **Processing**: [`MessageProcessor`] queues, request/acknowledgment
//!   correlation and the fixed-cadence pump
//! - **Facade**: [`Bridge`] composing the above behind the public API

#![deny(unsafe_code)]

pub mod bridge;
pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod metrics;
pub mod processor;
pub mod transport;

pub use bridge::Bridge;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use events::BridgeEvent;
pub use heartbeat::{HeartbeatManager, HeartbeatSignal};
pub use processor::{BufferStats, MessageProcessor, Outbound, ProcessorEvent};
pub use transport::memory::{MemoryPeer, MemoryTransport, OpenBehavior};
pub use transport::websocket::WebSocketTransport;
pub use transport::{Frame, Transport, TransportEvent, TransportLink};
