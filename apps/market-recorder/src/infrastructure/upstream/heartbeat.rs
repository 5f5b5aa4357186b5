//! Heartbeat Monitor
//!
//! Liveness check for the upstream socket. The read loop ticks the monitor
//! every `ping_interval`; each tick either asks for a ping or reports that
//! the previous ping went unanswered for longer than `pong_timeout`. Any
//! inbound frame counts as proof of life.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Shortest accepted ping interval.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after a ping that counts as a dead connection.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

/// What the read loop should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// The upstream stopped answering.
    TimedOut(Duration),
}

/// Per-connection heartbeat state.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    interval: Interval,
    ping_sent_at: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Start monitoring a freshly opened connection.
    ///
    /// A zero `ping_interval` is raised to one millisecond.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let period = config.ping_interval.max(MIN_PING_INTERVAL);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            interval,
            ping_sent_at: None,
        }
    }

    /// Wait for the next tick and decide what to do.
    pub async fn tick(&mut self) -> HeartbeatAction {
        let now = self.interval.tick().await;
        self.on_tick(now)
    }

    fn on_tick(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent) = self.ping_sent_at {
            let silent = now.saturating_duration_since(sent);
            if silent >= self.config.pong_timeout {
                return HeartbeatAction::TimedOut(silent);
            }
        }
        // Silence is measured from the oldest unanswered ping.
        self.ping_sent_at.get_or_insert(now);
        HeartbeatAction::SendPing
    }

    /// Record any inbound frame.
    pub const fn record_activity(&mut self) {
        self.ping_sent_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_pings() {
        let mut monitor = monitor();
        assert_eq!(monitor.tick().await, HeartbeatAction::SendPing);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_ping_times_out() {
        let mut monitor = monitor();
        assert_eq!(monitor.tick().await, HeartbeatAction::SendPing);
        assert_eq!(
            monitor.tick().await,
            HeartbeatAction::TimedOut(Duration::from_secs(5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_does_not_panic() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig {
            ping_interval: Duration::ZERO,
            pong_timeout: Duration::from_secs(5),
        });
        assert_eq!(monitor.tick().await, HeartbeatAction::SendPing);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_connection_alive() {
        let mut monitor = monitor();
        for _ in 0..4 {
            assert_eq!(monitor.tick().await, HeartbeatAction::SendPing);
            monitor.record_activity();
        }
    }
}
