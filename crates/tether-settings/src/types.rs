//! Bridge settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::ReconnectPolicy;

use crate::errors::{Result, SettingsError};

/// All recognised bridge options. Durations are milliseconds on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    /// Peer URL used by the WebSocket transport.
    pub url: String,
    /// Heartbeat probe interval.
    #[serde(rename = "heartbeatInterval")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed probes before a heartbeat timeout.
    pub heartbeat_max_missed: u32,
    /// Heartbeat interval applied by low-latency mode.
    #[serde(rename = "lowLatencyHeartbeatInterval")]
    pub low_latency_heartbeat_interval_ms: u64,
    /// Delay before the first reconnect.
    #[serde(rename = "reconnectBaseInterval")]
    pub reconnect_base_interval_ms: u64,
    /// Cap for any single reconnect delay.
    #[serde(rename = "reconnectMaxInterval")]
    pub reconnect_max_interval_ms: u64,
    /// Consecutive reconnect attempts before the connection manager stops.
    pub max_reconnect_attempts: u32,
    /// Time allowed for one connect attempt to reach `Open`.
    #[serde(rename = "connectionTimeout")]
    pub connection_timeout_ms: u64,
    /// Default timeout for correlated requests.
    #[serde(rename = "messageTimeout")]
    pub message_timeout_ms: u64,
    /// Timeout applied by the sweep to requests registered without one.
    #[serde(rename = "pendingSweepTimeout")]
    pub pending_sweep_timeout_ms: u64,
    /// Pump period.
    #[serde(rename = "tickInterval")]
    pub tick_interval_ms: u64,
    /// Persistent-bridge supervision period.
    #[serde(rename = "superviseInterval")]
    pub supervise_interval_ms: u64,
    /// Window in which a never-connected bridge keeps trying.
    #[serde(rename = "giveUpWindow")]
    pub give_up_window_ms: u64,
    /// Total reconnects tolerated once a connection has been achieved.
    pub max_total_reconnects: u32,
    /// Acknowledge inbound messages that request a response.
    pub auto_acknowledge: bool,
    /// Request compression from the transport.
    pub enable_compression: bool,
    /// Require an encrypted transport (`wss://`).
    pub enable_encryption: bool,
    /// Endpoint name stamped as `source` on outbound messages.
    pub local_endpoint: String,
    /// Default `target` for outbound messages.
    pub remote_endpoint: String,
    /// Undelivered messages kept for redelivery after a reconnect.
    pub failed_queue_capacity: usize,
    /// Capacity of each event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            heartbeat_interval_ms: 5000,
            heartbeat_max_missed: 3,
            low_latency_heartbeat_interval_ms: 1000,
            reconnect_base_interval_ms: 1000,
            reconnect_max_interval_ms: 30_000,
            max_reconnect_attempts: 10,
            connection_timeout_ms: 10_000,
            message_timeout_ms: 5000,
            pending_sweep_timeout_ms: 30_000,
            tick_interval_ms: 10,
            supervise_interval_ms: 1000,
            give_up_window_ms: 10_000,
            max_total_reconnects: 50,
            auto_acknowledge: true,
            enable_compression: false,
            enable_encryption: false,
            local_endpoint: "local".to_string(),
            remote_endpoint: "remote".to_string(),
            failed_queue_capacity: 1024,
            event_capacity: 1024,
        }
    }
}

impl BridgeSettings {
    /// Heartbeat probe interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat interval in low-latency mode.
    pub fn low_latency_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.low_latency_heartbeat_interval_ms)
    }

    /// Per-attempt connection timeout.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Default correlated-request timeout.
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Sweep timeout for requests registered without one.
    pub fn pending_sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_timeout_ms)
    }

    /// Pump period.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Supervision period.
    pub fn supervise_interval(&self) -> Duration {
        Duration::from_millis(self.supervise_interval_ms)
    }

    /// Never-connected give-up window.
    pub fn give_up_window(&self) -> Duration {
        Duration::from_millis(self.give_up_window_ms)
    }

    /// Reconnect backoff parameters.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_interval_ms),
            cap: Duration::from_millis(self.reconnect_max_interval_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Reject combinations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("heartbeatInterval", self.heartbeat_interval_ms),
            (
                "lowLatencyHeartbeatInterval",
                self.low_latency_heartbeat_interval_ms,
            ),
            ("reconnectBaseInterval", self.reconnect_base_interval_ms),
            ("connectionTimeout", self.connection_timeout_ms),
            ("messageTimeout", self.message_timeout_ms),
            ("pendingSweepTimeout", self.pending_sweep_timeout_ms),
            ("tickInterval", self.tick_interval_ms),
            ("superviseInterval", self.supervise_interval_ms),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(SettingsError::invalid(field, "must be positive"));
        }
        if self.reconnect_max_interval_ms < self.reconnect_base_interval_ms {
            return Err(SettingsError::invalid(
                "reconnectMaxInterval",
                "must not be below reconnectBaseInterval",
            ));
        }
        if self.heartbeat_max_missed == 0 {
            return Err(SettingsError::invalid("heartbeatMaxMissed", "must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(SettingsError::invalid("eventCapacity", "must be positive"));
        }
        if self.enable_encryption && !self.url.starts_with("wss://") {
            return Err(SettingsError::invalid(
                "enableEncryption",
                format!("requires a wss:// url, got {}", self.url),
            ));
        }
        Ok(())
    }
}
