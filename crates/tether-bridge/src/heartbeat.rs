//! Heartbeat ping/pong liveness monitoring.
//!
//! The manager knows nothing about the transport: it hands pings to its owner
//! as [`HeartbeatSignal::Ping`] and is told about pongs through
//! [`HeartbeatManager::handle_heartbeat_response`]. A silent peer (for example
//! a half-open TCP connection) surfaces as [`HeartbeatSignal::Timeout`]; the
//! manager never closes anything itself.

use std::sync::Arc;
use std::time::Duration;

use ::metrics::counter;
use parking_lot::Mutex;
use tether_core::{Message, MessageId};
use tether_settings::BridgeSettings;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::HEARTBEAT_TIMEOUTS_TOTAL;

/// Output of the heartbeat loop.
#[derive(Clone, Debug, PartialEq)]
pub enum HeartbeatSignal {
    /// A probe to write to the peer.
    Ping(Message),
    /// Consecutive misses reached the limit.
    Timeout {
        /// Misses counted.
        missed: u32,
    },
}

#[derive(Debug)]
struct ProbeState {
    interval: Duration,
    outstanding: Option<(MessageId, Instant)>,
    last_ack: Instant,
    missed: u32,
}

/// Periodic liveness prober.
pub struct HeartbeatManager {
    state: Mutex<ProbeState>,
    max_missed: u32,
    local: String,
    remote: String,
    signals: mpsc::UnboundedSender<HeartbeatSignal>,
    running: Mutex<Option<CancellationToken>>,
    rearm: Notify,
}

impl HeartbeatManager {
    /// Create a stopped manager and the receiver of its signals.
    pub fn new(
        interval: Duration,
        max_missed: u32,
        local: impl Into<String>,
        remote: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HeartbeatSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let manager = Self {
            state: Mutex::new(ProbeState {
                interval,
                outstanding: None,
                last_ack: Instant::now(),
                missed: 0,
            }),
            max_missed: max_missed.max(1),
            local: local.into(),
            remote: remote.into(),
            signals,
            running: Mutex::new(None),
            rearm: Notify::new(),
        };
        (Arc::new(manager), rx)
    }

    /// Create from bridge settings.
    pub fn from_settings(
        settings: &BridgeSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HeartbeatSignal>) {
        Self::new(
            settings.heartbeat_interval(),
            settings.heartbeat_max_missed,
            settings.local_endpoint.clone(),
            settings.remote_endpoint.clone(),
        )
    }

    /// Start probing every interval. No-op while already running.
    pub fn start(self: &Arc<Self>) {
        let cancel = {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
                return;
            }
            let token = CancellationToken::new();
            *running = Some(token.clone());
            token
        };
        {
            let mut state = self.state.lock();
            state.outstanding = None;
            state.last_ack = Instant::now();
            state.missed = 0;
        }
        debug!(interval_ms = self.interval().as_millis() as u64, "heartbeat started");
        let _ = tokio::spawn(Arc::clone(self).run(cancel));
    }

    /// Stop probing.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            debug!("heartbeat stopped");
        }
    }

    /// Whether the probe loop is running.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Current probe interval.
    pub fn interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Change the probe interval. A running loop re-arms immediately.
    pub fn set_interval(&self, interval: Duration) {
        self.state.lock().interval = interval;
        self.rearm.notify_waiters();
    }

    /// Consecutive misses counted so far.
    pub fn missed(&self) -> u32 {
        self.state.lock().missed
    }

    /// Build a probe and mark it outstanding as of `now`.
    pub fn create_ping(&self, now: Instant) -> Message {
        let ping = Message::ping(self.local.clone(), self.remote.clone());
        self.state.lock().outstanding = Some((ping.id.clone(), now));
        trace!(message_id = %ping.id, "heartbeat ping");
        ping
    }

    /// Account for a `pong` received at `now`.
    ///
    /// Any pong proves the peer alive and clears the miss counter. Returns the
    /// round-trip time when it answers the outstanding probe.
    pub fn handle_heartbeat_response(&self, message: &Message, now: Instant) -> Option<Duration> {
        if !message.is_pong() {
            return None;
        }
        let mut state = self.state.lock();
        state.missed = 0;
        state.last_ack = now;

        let answers_outstanding = matches!(
            (&state.outstanding, &message.correlation_id),
            (Some((id, _)), Some(correlation)) if id == correlation
        );
        if !answers_outstanding {
            return None;
        }
        let (_, sent_at) = state.outstanding.take()?;
        Some(now.saturating_duration_since(sent_at))
    }

    /// Count a miss when a probe is outstanding and more than twice the
    /// interval has passed since the last acknowledgment.
    ///
    /// Returns `true` (and signals [`HeartbeatSignal::Timeout`]) when the miss
    /// limit is reached; the counter then starts over.
    pub fn check_heartbeat_timeout(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.outstanding.is_none() {
            return false;
        }
        if now.saturating_duration_since(state.last_ack) <= state.interval * 2 {
            return false;
        }

        state.missed += 1;
        trace!(missed = state.missed, "heartbeat missed");
        if state.missed < self.max_missed {
            return false;
        }

        let missed = state.missed;
        state.missed = 0;
        state.outstanding = None;
        state.last_ack = now;
        drop(state);

        warn!(missed, "heartbeat timeout");
        counter!(HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
        let _ = self.signals.send(HeartbeatSignal::Timeout { missed });
        true
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval = self.interval();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = self.rearm.notified() => {}
                () = tokio::time::sleep(interval) => {
                    let now = Instant::now();
                    let _ = self.check_heartbeat_timeout(now);
                    let ping = self.create_ping(now);
                    if self.signals.send(HeartbeatSignal::Ping(ping)).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const INTERVAL: Duration = Duration::from_millis(50);

    fn manager() -> (Arc<HeartbeatManager>, mpsc::UnboundedReceiver<HeartbeatSignal>) {
        HeartbeatManager::new(INTERVAL, 3, "local", "remote")
    }

    #[tokio::test(start_paused = true)]
    async fn pong_reports_round_trip() {
        let (hb, _rx) = manager();
        let start = Instant::now();
        let ping = hb.create_ping(start);
        assert!(ping.is_ping());
        assert_eq!(ping.source, "local");
        assert_eq!(ping.target, "remote");

        let latency = hb.handle_heartbeat_response(&ping.pong(), start + Duration::from_millis(12));
        assert_eq!(latency, Some(Duration::from_millis(12)));
        assert_eq!(hb.missed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pong_clears_misses_without_latency() {
        let (hb, _rx) = manager();
        let t0 = Instant::now();
        let old = hb.create_ping(t0);
        let _current = hb.create_ping(t0 + INTERVAL);
        assert!(!hb.check_heartbeat_timeout(t0 + INTERVAL * 3));
        assert_eq!(hb.missed(), 1);

        let latency = hb.handle_heartbeat_response(&old.pong(), t0 + INTERVAL * 3);
        assert_eq!(latency, None);
        assert_eq!(hb.missed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_pong_is_ignored() {
        let (hb, _rx) = manager();
        let ping = hb.create_ping(Instant::now());
        assert_eq!(hb.handle_heartbeat_response(&ping, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn no_outstanding_probe_never_misses() {
        let (hb, _rx) = manager();
        let later = Instant::now() + Duration::from_secs(10);
        assert!(!hb.check_heartbeat_timeout(later));
        assert_eq!(hb.missed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_twice_interval_is_not_a_miss() {
        let (hb, _rx) = manager();
        let t0 = Instant::now();
        let _ = hb.create_ping(t0);
        assert!(!hb.check_heartbeat_timeout(t0 + INTERVAL * 2));
        assert_eq!(hb.missed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn third_miss_signals_timeout() {
        let (hb, mut rx) = manager();
        let t0 = Instant::now();
        let _ = hb.create_ping(t0);

        assert!(!hb.check_heartbeat_timeout(t0 + Duration::from_millis(101)));
        assert!(!hb.check_heartbeat_timeout(t0 + Duration::from_millis(150)));
        assert_eq!(hb.missed(), 2);
        assert!(hb.check_heartbeat_timeout(t0 + Duration::from_millis(200)));
        assert_eq!(rx.recv().await, Some(HeartbeatSignal::Timeout { missed: 3 }));

        // Counter starts over
        assert_eq!(hb.missed(), 0);
        assert!(!hb.check_heartbeat_timeout(t0 + Duration::from_millis(250)));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_times_out_when_peer_goes_silent() {
        let (hb, mut rx) = manager();
        let start = Instant::now();
        hb.start();
        assert!(hb.is_running());

        // Answer the first two pings, then go silent
        for _ in 0..2 {
            let ping = match rx.recv().await {
                Some(HeartbeatSignal::Ping(ping)) => ping,
                other => panic!("expected ping, got {other:?}"),
            };
            assert!(hb.handle_heartbeat_response(&ping.pong(), Instant::now()).is_some());
        }

        let missed = loop {
            match rx.recv().await {
                Some(HeartbeatSignal::Timeout { missed }) => break missed,
                Some(HeartbeatSignal::Ping(_)) => {}
                None => panic!("heartbeat channel closed"),
            }
        };
        assert_eq!(missed, 3);
        // Last pong at 100ms; misses counted at 250, 300 and 350ms
        assert_eq!(start.elapsed(), Duration::from_millis(350));
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_pings() {
        let (hb, mut rx) = manager();
        hb.start();
        assert_matches!(rx.recv().await, Some(HeartbeatSignal::Ping(_)));
        hb.stop();
        assert!(!hb.is_running());
        tokio::time::sleep(INTERVAL * 10).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_runs_one_loop() {
        let (hb, mut rx) = manager();
        hb.start();
        hb.start();
        tokio::time::sleep(INTERVAL * 4 + Duration::from_millis(1)).await;
        let mut pings = 0;
        while let Ok(signal) = rx.try_recv() {
            if matches!(signal, HeartbeatSignal::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 4);
        hb.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn set_interval_rearms_running_loop() {
        let (hb, mut rx) = HeartbeatManager::new(Duration::from_secs(5), 3, "local", "remote");
        hb.start();
        tokio::task::yield_now().await;

        let start = Instant::now();
        hb.set_interval(Duration::from_secs(1));
        assert_matches!(rx.recv().await, Some(HeartbeatSignal::Ping(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(hb.interval(), Duration::from_secs(1));
        hb.stop();
    }
}
