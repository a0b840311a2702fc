//! Connection health: metrics and the derived quality bucket.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Discretised connection health.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Latency under 50ms with almost no errors.
    #[default]
    Excellent,
    /// Latency under 100ms.
    Good,
    /// Latency under 200ms.
    Fair,
    /// Anything worse.
    Poor,
}

impl ConnectionQuality {
    /// Bucket a (latency, error count) sample.
    ///
    /// Pure: identical inputs always yield the same bucket.
    pub fn assess(latency_ms: f64, errors: u64) -> Self {
        if latency_ms < 50.0 && errors < 3 {
            Self::Excellent
        } else if latency_ms < 100.0 && errors < 5 {
            Self::Good
        } else if latency_ms < 200.0 && errors < 10 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
        }
    }
}

/// Bridge-lifetime connection statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetrics {
    /// Most recent heartbeat round-trip in milliseconds.
    pub latency: f64,
    /// Messages (sent + received) per second between the last two latency
    /// samples.
    pub throughput: f64,
    /// Derived from `latency` and `errors_count`.
    pub connection_quality: ConnectionQuality,
    /// Reconnects scheduled over the bridge lifetime.
    pub reconnect_count: u32,
    /// Epoch milliseconds of the last scheduled reconnect.
    pub last_reconnect_time: Option<i64>,
    /// Messages written to the transport.
    pub messages_sent: u64,
    /// Messages decoded from the transport.
    pub messages_received: u64,
    /// Transport errors, failed attempts and undecodable frames.
    pub errors_count: u64,
}

/// A change of quality bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QualityChange {
    /// Bucket before the sample.
    pub previous: ConnectionQuality,
    /// Bucket after the sample.
    pub current: ConnectionQuality,
}

/// Owns a [`ConnectionMetrics`] and keeps `connection_quality` in step with
/// its inputs. Mutators that can move the bucket return the change.
#[derive(Debug, Default)]
pub struct HealthTracker {
    metrics: ConnectionMetrics,
    last_sample: Option<(Instant, u64)>,
}

impl HealthTracker {
    /// Create a tracker with zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat round-trip observed at `at`.
    pub fn record_latency(&mut self, latency: Duration, at: Instant) -> Option<QualityChange> {
        self.metrics.latency = latency.as_secs_f64() * 1000.0;

        let total = self.metrics.messages_sent + self.metrics.messages_received;
        if let Some((previous_at, previous_total)) = self.last_sample {
            let elapsed = at.saturating_duration_since(previous_at).as_secs_f64();
            if elapsed > 0.0 {
                self.metrics.throughput = total.saturating_sub(previous_total) as f64 / elapsed;
            }
        }
        self.last_sample = Some((at, total));

        self.update_quality()
    }

    /// Record a transport-level error.
    pub fn record_error(&mut self) -> Option<QualityChange> {
        self.metrics.errors_count += 1;
        self.update_quality()
    }

    /// Record a message written to the transport.
    pub fn record_sent(&mut self) {
        self.metrics.messages_sent += 1;
    }

    /// Record a message decoded from the transport.
    pub fn record_received(&mut self) {
        self.metrics.messages_received += 1;
    }

    /// Record a scheduled reconnect at epoch milliseconds `timestamp_ms`.
    pub fn record_reconnect(&mut self, timestamp_ms: i64) {
        self.metrics.reconnect_count += 1;
        self.metrics.last_reconnect_time = Some(timestamp_ms);
    }

    /// Current quality bucket.
    pub fn quality(&self) -> ConnectionQuality {
        self.metrics.connection_quality
    }

    /// Copy of the current metrics.
    pub fn snapshot(&self) -> ConnectionMetrics {
        self.metrics.clone()
    }

    fn update_quality(&mut self) -> Option<QualityChange> {
        let previous = self.metrics.connection_quality;
        let current = ConnectionQuality::assess(self.metrics.latency, self.metrics.errors_count);
        self.metrics.connection_quality = current;
        (previous != current).then_some(QualityChange { previous, current })
    }
}
