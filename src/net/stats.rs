//! Connection liveness and statistics observers.

use std::fmt;
use std::sync::Mutex;

use crate::core::ErrorPayload;

/// Periodic throughput reading for one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThroughputSample {
    pub write_bps: u64,
    pub read_bps: u64,
    pub polls_per_sec: u64,
}

/// Why a connection went away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote end closed the stream cleanly.
    PeerClosed,
    /// Local node is draining.
    ShuttingDown,
    /// No traffic inside the negotiated window.
    HeartbeatExpired { idle_ms: u64 },
    /// The peer broke the protocol; the payload was sent back when the wire
    /// format allowed it.
    Protocol(ErrorPayload),
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::ShuttingDown => f.write_str("shutting down"),
            CloseReason::HeartbeatExpired { idle_ms } => {
                write!(f, "heartbeat expired after {idle_ms}ms idle")
            }
            CloseReason::Protocol(payload) => write!(f, "protocol error: {payload}"),
            CloseReason::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

/// Receives liveness and statistics callbacks for one or more connections.
///
/// The remote host/port are unknown when the observer is installed and are
/// delivered reactively via `on_peer_resolved`.
pub trait ConnectionObserver: Send + Sync {
    fn on_peer_resolved(&self, host: &str, port: u16);
    fn on_throughput_sample(&self, sample: &ThroughputSample);
    fn on_connection_closed(&self, reason: &CloseReason);
}

/// Default observer: logs samples and closures, remembering the resolved
/// peer for correlation.
#[derive(Default)]
pub struct LogObserver {
    remote: Mutex<Option<(String, u16)>>,
}

impl LogObserver {
    pub fn new() -> Self {
        Self::default()
    }

    fn remote_label(&self) -> String {
        match self.remote.lock() {
            Ok(guard) => match guard.as_ref() {
                Some((host, port)) => format!("{host}:{port}"),
                None => "unresolved".to_string(),
            },
            Err(_) => "unresolved".to_string(),
        }
    }
}

impl ConnectionObserver for LogObserver {
    fn on_peer_resolved(&self, host: &str, port: u16) {
        if let Ok(mut guard) = self.remote.lock() {
            *guard = Some((host.to_string(), port));
        }
        tracing::debug!(host, port, "peer resolved");
    }

    fn on_throughput_sample(&self, sample: &ThroughputSample) {
        tracing::info!(
            write_bps = sample.write_bps,
            read_bps = sample.read_bps,
            polls_per_sec = sample.polls_per_sec,
            remote = %self.remote_label(),
            "connection throughput"
        );
    }

    fn on_connection_closed(&self, reason: &CloseReason) {
        match reason {
            CloseReason::PeerClosed | CloseReason::ShuttingDown => {
                tracing::debug!(remote = %self.remote_label(), %reason, "connection closed");
            }
            _ => {
                tracing::warn!(remote = %self.remote_label(), %reason, "connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_observer_remembers_resolved_peer() {
        let observer = LogObserver::new();
        assert_eq!(observer.remote_label(), "unresolved");
        observer.on_peer_resolved("10.0.0.7", 9090);
        assert_eq!(observer.remote_label(), "10.0.0.7:9090");
    }
}
