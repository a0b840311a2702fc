//! Bridge error taxonomy.

use std::time::Duration;

/// Errors surfaced by the bridge and its components.
///
/// `Clone` so a single failure (for example a failed connect attempt) can be
/// delivered to every caller waiting on it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// A send was attempted while the transport was not open.
    #[error("not connected")]
    NotConnected,
    /// A correlated request was not acknowledged within its window.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Transport-level failure (open, write, or close).
    #[error("connection error: {0}")]
    Connection(String),
    /// A pending request was invalidated because the bridge shut down.
    #[error("bridge destroyed")]
    BridgeDestroyed,
    /// A message could not be encoded for the wire.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// An inbound frame did not decode into a message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// The bridge was built from settings it cannot run with.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl BridgeError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout(_) | Self::Connection(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::BridgeDestroyed => "bridge_destroyed",
            Self::Serialization(_) => "serialization",
            Self::InvalidMessage(_) => "invalid_message",
            Self::InvalidSettings(_) => "invalid_settings",
        }
    }
}

/// Result alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(BridgeError::NotConnected.to_string(), "not connected");
        assert_eq!(BridgeError::BridgeDestroyed.to_string(), "bridge destroyed");
        assert_eq!(
            BridgeError::Timeout(Duration::from_millis(100)).to_string(),
            "request timed out after 100ms"
        );
        assert_eq!(
            BridgeError::Connection("refused".into()).to_string(),
            "connection error: refused"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(BridgeError::NotConnected.is_retryable());
        assert!(BridgeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(BridgeError::Connection("reset".into()).is_retryable());
        assert!(!BridgeError::BridgeDestroyed.is_retryable());
        assert!(!BridgeError::InvalidMessage("bad".into()).is_retryable());
        assert!(!BridgeError::InvalidSettings("tickInterval: must be positive".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(BridgeError::NotConnected.error_kind(), "not_connected");
        assert_eq!(BridgeError::BridgeDestroyed.error_kind(), "bridge_destroyed");
        assert_eq!(
            BridgeError::Serialization("x".into()).error_kind(),
            "serialization"
        );
    }
}
