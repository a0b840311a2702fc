//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - **Branded IDs**: [`MessageId`] and [`LinkId`] newtypes over UUID v7 strings
//! - **Messages**: the [`Message`] wire envelope, [`MessageType`], [`Priority`]
//!   and the caller-facing [`MessageDraft`]
//! - **Health**: [`ConnectionMetrics`], [`ConnectionQuality`] and the
//!   [`HealthTracker`] that keeps them consistent
//! - **Errors**: [`BridgeError`] taxonomy via `thiserror`
//! - **Backoff**: [`ReconnectPolicy`] exponential delay math
//! - **Logging**: `tracing` subscriber initialisation

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod health;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod retry;

pub use errors::{BridgeError, Result};
pub use health::{ConnectionMetrics, ConnectionQuality, HealthTracker, QualityChange};
pub use ids::{LinkId, MessageId};
pub use messages::{Message, MessageDraft, MessageType, Priority};
pub use retry::ReconnectPolicy;
