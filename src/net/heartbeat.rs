//! Per-connection heartbeat tracking.
//!
//! This is the only timeout mechanism in the transport: a stalled peer is
//! detected solely by the absence of traffic inside the negotiated window.

use std::time::{SystemTime, UNIX_EPOCH};

use super::proto::Heartbeat;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatDecision {
    Send(Heartbeat),
    Close { idle_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct HeartbeatTracker {
    interval_ms: u64,
    timeout_ms: u64,
    last_recv_ms: u64,
    last_send_ms: u64,
    next_nonce: u64,
}

impl HeartbeatTracker {
    pub fn new(interval_ms: u64, timeout_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            last_recv_ms: now_ms,
            last_send_ms: now_ms,
            next_nonce: 1,
        }
    }

    /// Any inbound traffic counts, not just heartbeat frames.
    pub fn note_recv(&mut self, now_ms: u64) {
        self.last_recv_ms = now_ms;
    }

    pub fn note_send(&mut self, now_ms: u64) {
        self.last_send_ms = now_ms;
    }

    /// Applied when the handshake negotiates a different timeout.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn poll(&mut self, now_ms: u64) -> Option<HeartbeatDecision> {
        let idle_ms = now_ms.saturating_sub(self.last_recv_ms);
        if self.timeout_ms > 0 && idle_ms >= self.timeout_ms {
            return Some(HeartbeatDecision::Close { idle_ms });
        }
        if self.interval_ms > 0 && now_ms.saturating_sub(self.last_send_ms) >= self.interval_ms {
            let nonce = self.next_nonce;
            self.next_nonce = self.next_nonce.saturating_add(1);
            return Some(HeartbeatDecision::Send(Heartbeat { nonce }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_heartbeat_after_send_interval() {
        let mut tracker = HeartbeatTracker::new(100, 1_000, 0);

        assert!(tracker.poll(99).is_none());
        match tracker.poll(100).expect("heartbeat") {
            HeartbeatDecision::Send(hb) => assert_eq!(hb.nonce, 1),
            HeartbeatDecision::Close { .. } => panic!("unexpected close"),
        }
        tracker.note_send(100);

        assert!(tracker.poll(150).is_none());
        match tracker.poll(201).expect("heartbeat") {
            HeartbeatDecision::Send(hb) => assert_eq!(hb.nonce, 2),
            HeartbeatDecision::Close { .. } => panic!("unexpected close"),
        }
    }

    #[test]
    fn deadline_trumps_send() {
        let mut tracker = HeartbeatTracker::new(50, 100, 0);
        assert!(matches!(
            tracker.poll(101),
            Some(HeartbeatDecision::Close { idle_ms: 101 })
        ));
    }

    #[test]
    fn any_traffic_resets_deadline() {
        let mut tracker = HeartbeatTracker::new(0, 100, 0);

        tracker.note_recv(80);
        assert!(tracker.poll(150).is_none());
        assert!(matches!(
            tracker.poll(181),
            Some(HeartbeatDecision::Close { .. })
        ));
    }

    #[test]
    fn negotiated_timeout_applies() {
        let mut tracker = HeartbeatTracker::new(0, 10_000, 0);
        tracker.set_timeout(100);
        assert!(tracker.poll(99).is_none());
        assert!(matches!(
            tracker.poll(100),
            Some(HeartbeatDecision::Close { .. })
        ));
    }
}
