//! Replicated map collaborator boundary.
//!
//! The transport only ever applies origin-tagged changes and enumerates
//! current state for a newly joining peer. Conflict resolution, eviction and
//! storage layout belong to the implementation behind this trait.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::core::{HostId, ReplicatedChange};

#[derive(Debug, Error)]
#[error("replicated map apply failed: {reason}")]
pub struct MapApplyError {
    pub reason: String,
}

pub trait ReplicatedMap: Send {
    /// Apply one change. Failures are the map's own contract to resolve;
    /// redelivery is already deduplicated upstream.
    fn apply(&mut self, change: &ReplicatedChange) -> Result<(), MapApplyError>;

    /// Current state serialized as a change log, for bootstrapping a newly
    /// joining peer. Ordered by (origin, seq).
    fn snapshot(&self) -> Vec<ReplicatedChange>;
}

/// Minimal in-memory map: an append-only change log keyed by (origin, seq).
///
/// Serves as the default map for the startup channel and as the reference
/// implementation in tests.
#[derive(Debug, Default)]
pub struct LogMap {
    log: BTreeMap<(HostId, u64), ReplicatedChange>,
}

impl LogMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl ReplicatedMap for LogMap {
    fn apply(&mut self, change: &ReplicatedChange) -> Result<(), MapApplyError> {
        self.log.insert(change.key(), change.clone());
        Ok(())
    }

    fn snapshot(&self) -> Vec<ReplicatedChange> {
        self.log.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::DEFAULT_CHANNEL;

    #[test]
    fn applying_the_same_change_twice_is_idempotent() {
        let mut map = LogMap::new();
        let change = ReplicatedChange::new(
            DEFAULT_CHANNEL,
            HostId::new(1).unwrap(),
            1,
            Bytes::from_static(b"v"),
        );
        map.apply(&change).unwrap();
        map.apply(&change).unwrap();
        assert_eq!(map.snapshot(), vec![change]);
    }

    #[test]
    fn snapshot_is_ordered_by_origin_then_seq() {
        let mut map = LogMap::new();
        let a2 = ReplicatedChange::new(DEFAULT_CHANNEL, HostId::new(1).unwrap(), 2, Bytes::new());
        let b1 = ReplicatedChange::new(DEFAULT_CHANNEL, HostId::new(2).unwrap(), 1, Bytes::new());
        let a1 = ReplicatedChange::new(DEFAULT_CHANNEL, HostId::new(1).unwrap(), 1, Bytes::new());
        map.apply(&a2).unwrap();
        map.apply(&b1).unwrap();
        map.apply(&a1).unwrap();
        assert_eq!(map.snapshot(), vec![a1, a2, b1]);
    }
}
