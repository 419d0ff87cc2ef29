//! Transport safety limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Hard bounds applied to every connection and channel.
///
/// Field names carry their units.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest frame body accepted or produced on any wire.
    pub max_frame_bytes: usize,
    /// Live connections per node; the acceptor answers over-capacity peers
    /// with a retryable error.
    pub max_connections: usize,

    /// Out-of-order changes buffered per (channel, origin) before the frame
    /// is rejected.
    pub max_gap_events: usize,
    pub max_gap_bytes: usize,

    /// Cadence of throughput samples delivered to the connection observer.
    pub stats_interval_ms: u64,
    /// Acceptor back-off when the listening socket has nothing pending.
    pub accept_retry_ms: u64,
    /// Connection loop tick driving heartbeat and drain checks.
    pub tick_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            max_connections: 64,

            max_gap_events: 10_000,
            max_gap_bytes: 16 * 1024 * 1024,

            stats_interval_ms: 10_000,
            accept_retry_ms: 25,
            tick_ms: 25,
        }
    }
}
