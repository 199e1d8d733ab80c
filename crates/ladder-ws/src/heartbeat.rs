//! Heartbeat monitoring for the market-data connection.
//!
//! Tracks ping/ack timing and counts consecutive intervals without an
//! acknowledgment. Half-open sockets that the transport still reports
//! as connected are detected here and force a full reconnect.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::debug;

/// Heartbeat monitor for connection health.
pub struct HeartbeatMonitor {
    /// Interval between keepalive pings.
    interval_ms: u64,
    /// How long an ack may lag behind its ping.
    timeout_ms: u64,
    /// Consecutive missed acks before forcing a reconnect.
    max_failures: u32,
    /// Last ping sent time.
    last_ping: RwLock<Option<DateTime<Utc>>>,
    /// Last acknowledgment received time.
    last_ack: RwLock<Option<DateTime<Utc>>>,
    /// Last inbound message of any kind.
    last_message: RwLock<DateTime<Utc>>,
    /// Whether a ping is outstanding.
    waiting_for_ack: RwLock<bool>,
    /// Consecutive check intervals with an overdue ack.
    missed: RwLock<u32>,
}

impl HeartbeatMonitor {
    pub fn new(interval_ms: u64, timeout_ms: u64, max_failures: u32) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            max_failures,
            last_ping: RwLock::new(None),
            last_ack: RwLock::new(None),
            last_message: RwLock::new(Utc::now()),
            waiting_for_ack: RwLock::new(false),
            missed: RwLock::new(0),
        }
    }

    /// Reset state (called on every successful open).
    pub fn reset(&self) {
        *self.last_ping.write() = None;
        *self.last_ack.write() = None;
        *self.last_message.write() = Utc::now();
        *self.waiting_for_ack.write() = false;
        *self.missed.write() = 0;
    }

    /// Record that a keepalive ping was sent.
    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Utc::now());
        *self.waiting_for_ack.write() = true;
    }

    /// Record a keepalive acknowledgment. Clears the missed counter.
    pub fn record_ack(&self) {
        let now = Utc::now();
        *self.last_ack.write() = Some(now);
        *self.waiting_for_ack.write() = false;
        *self.missed.write() = 0;

        if let Some(ping_time) = *self.last_ping.read() {
            let rtt_ms = (now - ping_time).num_milliseconds();
            debug!(rtt_ms, "Heartbeat acknowledged");
        }
    }

    /// Record that any message arrived (activity counts toward liveness).
    pub fn record_message(&self) {
        *self.last_message.write() = Utc::now();
    }

    /// Periodic check. Increments the missed counter when an ack is
    /// overdue and returns the new count.
    pub fn on_check(&self) -> u32 {
        let overdue = {
            let waiting = *self.waiting_for_ack.read();
            if !waiting {
                false
            } else if let Some(ping_time) = *self.last_ping.read() {
                (Utc::now() - ping_time).num_milliseconds() > self.timeout_ms as i64
            } else {
                false
            }
        };

        if overdue {
            // Re-arm so the next interval pings again; a single slow ack
            // must not count twice.
            *self.waiting_for_ack.write() = false;
            let mut missed = self.missed.write();
            *missed += 1;
            debug!(missed = *missed, "Heartbeat ack overdue");
            *missed
        } else {
            *self.missed.read()
        }
    }

    /// Current consecutive missed-ack count.
    pub fn missed(&self) -> u32 {
        *self.missed.read()
    }

    /// Check whether missed acks crossed the reconnect threshold.
    pub fn should_force_reconnect(&self) -> bool {
        *self.missed.read() >= self.max_failures
    }

    /// Check whether a ping should go out this interval.
    pub fn should_send_ping(&self) -> bool {
        if *self.waiting_for_ack.read() {
            return false;
        }
        let quiet_ms = (Utc::now() - *self.last_message.read()).num_milliseconds();
        quiet_ms >= self.interval_ms as i64
    }

    /// Wait until the next heartbeat check is due.
    pub async fn wait_for_check(&self) {
        tokio::time::sleep(Duration::from_millis(self.interval_ms / 2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let hb = HeartbeatMonitor::new(15000, 5000, 3);
        assert_eq!(hb.missed(), 0);
        assert!(!hb.should_force_reconnect());
    }

    #[test]
    fn test_ack_clears_missed() {
        let hb = HeartbeatMonitor::new(15000, 5000, 3);

        hb.record_ping();
        assert!(*hb.waiting_for_ack.read());

        hb.record_ack();
        assert!(!*hb.waiting_for_ack.read());
        assert_eq!(hb.missed(), 0);
    }

    #[test]
    fn test_overdue_ack_counts_once_per_check() {
        let hb = HeartbeatMonitor::new(15000, 0, 3);

        hb.record_ping();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(hb.on_check(), 1);
        // Cleared waiting flag: the same overdue ping does not count again
        assert_eq!(hb.on_check(), 1);

        hb.record_ping();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(hb.on_check(), 2);
    }

    #[test]
    fn test_force_reconnect_threshold() {
        let hb = HeartbeatMonitor::new(15000, 0, 2);

        for _ in 0..2 {
            hb.record_ping();
            std::thread::sleep(Duration::from_millis(2));
            hb.on_check();
        }

        assert!(hb.should_force_reconnect());

        hb.reset();
        assert!(!hb.should_force_reconnect());
    }

    #[test]
    fn test_no_ping_while_waiting() {
        let hb = HeartbeatMonitor::new(0, 5000, 3);
        assert!(hb.should_send_ping());
        hb.record_ping();
        assert!(!hb.should_send_ping());
    }
}
