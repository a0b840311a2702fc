//! Metric names recorded through the `metrics` facade.
//!
//! The library only records; installing a recorder/exporter is left to the
//! embedding binary.

// Metric name constants to avoid typos across modules.

/// Messages written to the transport (counter).
pub const MESSAGES_SENT_TOTAL: &str = "bridge_messages_sent_total";
/// Messages decoded from the transport (counter).
pub const MESSAGES_RECEIVED_TOTAL: &str = "bridge_messages_received_total";
/// Outgoing messages that could not be handed to the transport (counter, labels: error_kind).
pub const SEND_FAILURES_TOTAL: &str = "bridge_send_failures_total";
/// Inbound frames that failed to decode (counter).
pub const DECODE_FAILURES_TOTAL: &str = "bridge_decode_failures_total";
/// Reconnects scheduled (counter).
pub const RECONNECTS_TOTAL: &str = "bridge_reconnects_total";
/// Successful transport opens (counter).
pub const CONNECTIONS_TOTAL: &str = "bridge_connections_total";
/// Heartbeat timeouts (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "bridge_heartbeat_timeouts_total";
/// Correlated requests rejected by the timeout sweep (counter).
pub const REQUEST_TIMEOUTS_TOTAL: &str = "bridge_request_timeouts_total";
/// Correlated requests currently awaiting acknowledgment (gauge).
pub const PENDING_REQUESTS: &str = "bridge_pending_requests";
/// Heartbeat round-trip latency in seconds (histogram).
pub const HEARTBEAT_LATENCY_SECONDS: &str = "bridge_heartbeat_latency_seconds";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            MESSAGES_SENT_TOTAL,
            MESSAGES_RECEIVED_TOTAL,
            SEND_FAILURES_TOTAL,
            DECODE_FAILURES_TOTAL,
            RECONNECTS_TOTAL,
            CONNECTIONS_TOTAL,
            HEARTBEAT_TIMEOUTS_TOTAL,
            REQUEST_TIMEOUTS_TOTAL,
            PENDING_REQUESTS,
            HEARTBEAT_LATENCY_SECONDS,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
