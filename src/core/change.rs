//! Origin-tagged replicated change records.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::identity::{ChannelId, HostId};

/// One change to a channel's replicated map.
///
/// `(origin, seq)` is the dedup key: seq is 1-based and strictly monotonic
/// per origin, so redelivery and reordering are detectable without looking
/// at the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedChange {
    pub channel: ChannelId,
    pub origin: HostId,
    pub seq: u64,
    pub payload: Bytes,
}

impl ReplicatedChange {
    pub fn new(channel: ChannelId, origin: HostId, seq: u64, payload: Bytes) -> Self {
        Self {
            channel,
            origin,
            seq,
            payload,
        }
    }

    pub fn key(&self) -> (HostId, u64) {
        (self.origin, self.seq)
    }
}
