//! Per-origin apply ordering.
//!
//! Changes from one origin must apply in sequence order even when the
//! network delivers them out of order. Each stream keeps the applied
//! watermark and a bounded buffer of future changes; contiguous runs drain
//! as soon as the missing change arrives.

use std::collections::BTreeMap;

use crate::core::{HostId, Limits, ReplicatedChange};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// In-order batch ready to apply, starting with the ingested change and
    /// including any buffered successors it unblocked.
    Apply(Vec<ReplicatedChange>),
    /// Out of order; buffered until the gap closes.
    Buffered { missing_from: u64 },
    /// At or below the applied watermark, or already buffered.
    Duplicate,
    /// Reorder buffer is full; the change was dropped.
    Overflow,
}

#[derive(Clone, Debug)]
pub struct OriginStream {
    origin: HostId,
    applied_seq: u64,
    pending: BTreeMap<u64, ReplicatedChange>,
    pending_bytes: usize,
    max_events: usize,
    max_bytes: usize,
}

impl OriginStream {
    pub fn new(origin: HostId, limits: &Limits) -> Self {
        Self {
            origin,
            applied_seq: 0,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            max_events: limits.max_gap_events,
            max_bytes: limits.max_gap_bytes,
        }
    }

    pub fn origin(&self) -> HostId {
        self.origin
    }

    pub fn applied_seq(&self) -> u64 {
        self.applied_seq
    }

    pub fn ingest(&mut self, change: ReplicatedChange) -> IngestOutcome {
        debug_assert_eq!(change.origin, self.origin);

        if change.seq <= self.applied_seq || self.pending.contains_key(&change.seq) {
            return IngestOutcome::Duplicate;
        }

        if change.seq != self.applied_seq + 1 {
            if self.pending.len() >= self.max_events
                || self.pending_bytes + change.payload.len() > self.max_bytes
            {
                return IngestOutcome::Overflow;
            }
            let missing_from = self.applied_seq + 1;
            self.pending_bytes += change.payload.len();
            self.pending.insert(change.seq, change);
            return IngestOutcome::Buffered { missing_from };
        }

        let mut batch = vec![change];
        let mut next = self.applied_seq + 2;
        while let Some(buffered) = self.pending.remove(&next) {
            self.pending_bytes = self.pending_bytes.saturating_sub(buffered.payload.len());
            batch.push(buffered);
            next += 1;
        }
        self.applied_seq = next - 1;
        IngestOutcome::Apply(batch)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::core::{ChannelId, DEFAULT_CHANNEL};

    fn change(seq: u64) -> ReplicatedChange {
        ReplicatedChange::new(
            DEFAULT_CHANNEL,
            HostId::new(2).unwrap(),
            seq,
            Bytes::from_static(b"delta"),
        )
    }

    fn stream() -> OriginStream {
        OriginStream::new(HostId::new(2).unwrap(), &Limits::default())
    }

    #[test]
    fn in_order_changes_apply_immediately() {
        let mut stream = stream();
        assert_eq!(stream.ingest(change(1)), IngestOutcome::Apply(vec![change(1)]));
        assert_eq!(stream.ingest(change(2)), IngestOutcome::Apply(vec![change(2)]));
        assert_eq!(stream.applied_seq(), 2);
    }

    #[test]
    fn out_of_order_changes_buffer_and_drain_in_sequence() {
        let mut stream = stream();
        assert_eq!(
            stream.ingest(change(3)),
            IngestOutcome::Buffered { missing_from: 1 }
        );
        assert_eq!(
            stream.ingest(change(2)),
            IngestOutcome::Buffered { missing_from: 1 }
        );
        assert_eq!(
            stream.ingest(change(1)),
            IngestOutcome::Apply(vec![change(1), change(2), change(3)])
        );
        assert_eq!(stream.applied_seq(), 3);
    }

    #[test]
    fn duplicates_are_noops_applied_or_buffered() {
        let mut stream = stream();
        stream.ingest(change(1));
        assert_eq!(stream.ingest(change(1)), IngestOutcome::Duplicate);

        stream.ingest(change(5));
        assert_eq!(stream.ingest(change(5)), IngestOutcome::Duplicate);
    }

    #[test]
    fn overflow_rejects_instead_of_growing_without_bound() {
        let limits = Limits {
            max_gap_events: 2,
            ..Limits::default()
        };
        let mut stream = OriginStream::new(HostId::new(2).unwrap(), &limits);
        stream.ingest(change(10));
        stream.ingest(change(11));
        assert_eq!(stream.ingest(change(12)), IngestOutcome::Overflow);
    }

    #[test]
    fn streams_are_per_channel_payload_agnostic() {
        let mut stream = stream();
        let other_channel = ReplicatedChange::new(
            ChannelId::new(9).unwrap(),
            HostId::new(2).unwrap(),
            1,
            Bytes::new(),
        );
        assert!(matches!(
            stream.ingest(other_channel),
            IngestOutcome::Apply(_)
        ));
    }
}
