//! Heartbeat-based liveness, independent of what the transport reports.

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::envelope::Envelope;
use crate::peer::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

/// Result of one heartbeat tick.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessTick {
    pub status: LivenessStatus,
    /// Heartbeat to transmit, if the channel is open.
    pub heartbeat: Option<Envelope>,
    /// Liveness declared the link down and the transport has not reported
    /// `Connected` within the grace period: force recovery.
    pub escalate: bool,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    status: LivenessStatus,
    missed: u32,
    next_seq: u64,
    outstanding: Option<u64>,
    last_accepted_seq: Option<u64>,
    last_response_at: Option<Instant>,
    down_since: Option<Instant>,
    escalated: bool,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            status: LivenessStatus::Connected,
            missed: 0,
            next_seq: 0,
            outstanding: None,
            last_accepted_seq: None,
            last_response_at: None,
            down_since: None,
            escalated: false,
        }
    }

    pub fn status(&self) -> LivenessStatus {
        self.status
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn last_response_at(&self) -> Option<Instant> {
        self.last_response_at
    }

    /// Forget in-flight heartbeats; used when a fresh channel opens. Sequence
    /// numbers keep increasing so late echoes from the old channel stay stale.
    pub fn reset(&mut self) {
        self.status = LivenessStatus::Connected;
        self.missed = 0;
        self.outstanding = None;
        self.down_since = None;
        self.escalated = false;
    }

    pub fn tick(
        &mut self,
        now: Instant,
        channel_open: bool,
        transport: ConnectionState,
    ) -> LivenessTick {
        if !channel_open || self.outstanding.is_some() {
            self.missed += 1;
            let next = if self.missed >= self.config.disconnect_after {
                LivenessStatus::Disconnected
            } else {
                LivenessStatus::Reconnecting
            };
            self.transition(next, now);
            debug!(
                target = "quiz_link::liveness",
                missed = self.missed,
                channel_open,
                "heartbeat missed"
            );
        }

        let heartbeat = channel_open.then(|| {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.outstanding = Some(seq);
            Envelope::heartbeat(seq)
        });

        let escalate = match self.down_since {
            Some(since)
                if !self.escalated
                    && transport != ConnectionState::Connected
                    && now.duration_since(since) >= self.config.transport_grace =>
            {
                self.escalated = true;
                warn!(
                    target = "quiz_link::liveness",
                    ?transport,
                    down_for = ?now.duration_since(since),
                    "link unresponsive and transport not connected; forcing recovery"
                );
                true
            }
            _ => false,
        };

        LivenessTick {
            status: self.status,
            heartbeat,
            escalate,
        }
    }

    /// Record a heartbeat echo. Returns `true` when it is fresh, i.e. newer than
    /// every response accepted so far.
    pub fn on_response(&mut self, seq: u64, now: Instant) -> bool {
        if self.last_accepted_seq.is_some_and(|last| seq <= last) {
            return false;
        }
        self.last_accepted_seq = Some(seq);
        self.last_response_at = Some(now);
        if self.outstanding.is_some_and(|pending| pending <= seq) {
            self.outstanding = None;
        }
        self.missed = 0;
        self.escalated = false;
        self.transition(LivenessStatus::Connected, now);
        true
    }

    fn transition(&mut self, next: LivenessStatus, now: Instant) {
        if next == LivenessStatus::Disconnected {
            self.down_since.get_or_insert(now);
        } else {
            self.down_since = None;
        }
        if self.status == next {
            return;
        }
        info!(
            target = "quiz_link::liveness",
            from = ?self.status,
            to = ?next,
            "liveness status changed"
        );
        self.status = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(LivenessConfig::default())
    }

    #[test]
    fn three_missed_heartbeats_disconnect_and_fresh_response_recovers() {
        let mut liveness = monitor();
        let mut now = Instant::now();

        let first = liveness.tick(now, true, ConnectionState::Connected);
        assert_eq!(first.status, LivenessStatus::Connected);
        assert_eq!(first.heartbeat.as_ref().and_then(Envelope::heartbeat_seq), Some(0));

        let mut last = first;
        for _ in 0..3 {
            now += Duration::from_secs(3);
            last = liveness.tick(now, true, ConnectionState::Connected);
        }
        assert_eq!(liveness.missed(), 3);
        assert_eq!(last.status, LivenessStatus::Disconnected);
        assert!(!last.escalate, "transport still reports connected");

        let seq = last.heartbeat.and_then(|heartbeat| heartbeat.heartbeat_seq()).unwrap();
        assert!(liveness.on_response(seq, now));
        assert_eq!(liveness.status(), LivenessStatus::Connected);
        assert_eq!(liveness.missed(), 0);
    }

    #[test]
    fn single_miss_reports_reconnecting() {
        let mut liveness = monitor();
        let now = Instant::now();
        let tick = liveness.tick(now, false, ConnectionState::Connected);
        assert_eq!(tick.status, LivenessStatus::Reconnecting);
        assert!(tick.heartbeat.is_none());
    }

    #[test]
    fn stale_responses_are_ignored() {
        let mut liveness = monitor();
        let now = Instant::now();
        liveness.tick(now, true, ConnectionState::Connected);
        liveness.tick(now, true, ConnectionState::Connected);
        assert!(liveness.on_response(1, now));
        assert!(!liveness.on_response(0, now));
        assert!(!liveness.on_response(1, now));
    }

    #[test]
    fn escalates_once_after_transport_grace() {
        let mut liveness = monitor();
        let mut now = Instant::now();
        for _ in 0..3 {
            liveness.tick(now, false, ConnectionState::Disconnected);
            now += Duration::from_secs(3);
        }
        assert_eq!(liveness.status(), LivenessStatus::Disconnected);

        let tick = liveness.tick(now, false, ConnectionState::Disconnected);
        assert!(!tick.escalate, "only 3s since disconnect");

        now += Duration::from_secs(3);
        assert!(liveness.tick(now, false, ConnectionState::Disconnected).escalate);
        now += Duration::from_secs(3);
        assert!(!liveness.tick(now, false, ConnectionState::Disconnected).escalate);
    }
}
