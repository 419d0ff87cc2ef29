//! Replication hub: channel table, routing, peer fan-out bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use thiserror::Error;

use crate::config::TransportConfig;
use crate::core::{ChannelId, HostId, Limits, ReplicatedChange};

use super::map::{LogMap, ReplicatedMap};
use super::stream::{IngestOutcome, OriginStream};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown channel id {0}")]
    UnknownChannel(ChannelId),
    #[error("replication hub is closed")]
    Closed,
}

/// What became of one inbound replication frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Changes applied in order; forward them to the other peers.
    Applied(Vec<ReplicatedChange>),
    /// Redelivery; nothing to do.
    Duplicate,
    /// Out of order; held until the gap closes.
    Buffered { missing_from: u64 },
    /// Reflection of our own change; never re-applied.
    OwnOrigin,
    /// The origin's reorder buffer is full.
    Overflow,
}

/// One logical replicated map shared with the peers replicating it.
///
/// Channels are never destroyed while the hub is open; ids are permanent for
/// the hub's lifetime.
pub struct Channel {
    id: ChannelId,
    local_host: HostId,
    map: Box<dyn ReplicatedMap>,
    peers: BTreeSet<HostId>,
    streams: BTreeMap<HostId, OriginStream>,
    next_local_seq: u64,
    limits: Limits,
}

impl Channel {
    fn new(id: ChannelId, local_host: HostId, map: Box<dyn ReplicatedMap>, limits: Limits) -> Self {
        Self {
            id,
            local_host,
            map,
            peers: BTreeSet::new(),
            streams: BTreeMap::new(),
            next_local_seq: 1,
            limits,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peers(&self) -> &BTreeSet<HostId> {
        &self.peers
    }

    pub fn snapshot(&self) -> Vec<ReplicatedChange> {
        self.map.snapshot()
    }

    /// Apply a change received from the network, preserving within-origin
    /// sequence order.
    fn apply_remote(&mut self, change: ReplicatedChange) -> RouteOutcome {
        if change.origin == self.local_host {
            return RouteOutcome::OwnOrigin;
        }
        let origin = change.origin;
        let limits = self.limits.clone();
        let stream = self
            .streams
            .entry(origin)
            .or_insert_with(|| OriginStream::new(origin, &limits));
        match stream.ingest(change) {
            IngestOutcome::Apply(batch) => {
                for change in &batch {
                    if let Err(err) = self.map.apply(change) {
                        // The map owns retry/repair; the watermark has moved on.
                        tracing::warn!(
                            channel = %self.id,
                            origin = %change.origin,
                            seq = change.seq,
                            "replicated map apply failed: {err}"
                        );
                    }
                }
                RouteOutcome::Applied(batch)
            }
            IngestOutcome::Buffered { missing_from } => RouteOutcome::Buffered { missing_from },
            IngestOutcome::Duplicate => RouteOutcome::Duplicate,
            IngestOutcome::Overflow => RouteOutcome::Overflow,
        }
    }

    /// Record a change produced by this node, assigning the next local
    /// sequence number.
    fn publish_local(&mut self, payload: Bytes) -> ReplicatedChange {
        let change = ReplicatedChange::new(self.id, self.local_host, self.next_local_seq, payload);
        self.next_local_seq += 1;
        if let Err(err) = self.map.apply(&change) {
            tracing::warn!(channel = %self.id, seq = change.seq, "local apply failed: {err}");
        }
        change
    }
}

/// Owns every channel of one node and routes replication traffic to them.
pub struct ReplicationHub {
    host: HostId,
    transport: TransportConfig,
    channels: BTreeMap<ChannelId, Channel>,
    limits: Limits,
    open: bool,
}

impl ReplicationHub {
    pub fn new(host: HostId, transport: TransportConfig, limits: Limits) -> Self {
        Self {
            host,
            transport,
            channels: BTreeMap::new(),
            limits,
            open: true,
        }
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Get or create the channel for `id`. Idempotent: repeated calls return
    /// the same channel. Fresh channels get the default in-memory map.
    pub fn channel(&mut self, id: ChannelId) -> &mut Channel {
        let host = self.host;
        let limits = self.limits.clone();
        self.channels
            .entry(id)
            .or_insert_with(|| Channel::new(id, host, Box::new(LogMap::new()), limits))
    }

    /// Provision `id` with a specific map. If the channel already exists its
    /// map is kept; ids are permanent for the hub's lifetime.
    pub fn create_channel(&mut self, id: ChannelId, map: Box<dyn ReplicatedMap>) -> &mut Channel {
        let host = self.host;
        let limits = self.limits.clone();
        self.channels
            .entry(id)
            .or_insert_with(|| Channel::new(id, host, map, limits))
    }

    pub fn channel_ref(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Route one inbound replication frame. Unknown channel ids are rejected
    /// rather than lazily created: provisioning is an explicit act, and a
    /// misbehaving peer must not grow the channel table.
    pub fn route_inbound(&mut self, change: ReplicatedChange) -> Result<RouteOutcome, RouteError> {
        if !self.open {
            return Err(RouteError::Closed);
        }
        let id = change.channel;
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(RouteError::UnknownChannel(id));
        };
        Ok(channel.apply_remote(change))
    }

    /// Record a locally produced change on an existing channel.
    pub fn publish_local(
        &mut self,
        id: ChannelId,
        payload: Bytes,
    ) -> Result<ReplicatedChange, RouteError> {
        if !self.open {
            return Err(RouteError::Closed);
        }
        let Some(channel) = self.channels.get_mut(&id) else {
            return Err(RouteError::UnknownChannel(id));
        };
        Ok(channel.publish_local(payload))
    }

    /// A connection bound to `peer` is live: join it to every channel and
    /// return each channel's current state so the peer can be bootstrapped.
    /// Changes the peer itself originated are excluded.
    pub fn bind_peer(&mut self, peer: HostId) -> Vec<ReplicatedChange> {
        let mut bootstrap = Vec::new();
        for channel in self.channels.values_mut() {
            if peer == channel.local_host {
                continue;
            }
            channel.peers.insert(peer);
            bootstrap.extend(
                channel
                    .snapshot()
                    .into_iter()
                    .filter(|change| change.origin != peer),
            );
        }
        bootstrap
    }

    /// The peer's connection died: release its slot in every channel.
    pub fn release_peer(&mut self, peer: HostId) {
        for channel in self.channels.values_mut() {
            channel.peers.remove(&peer);
        }
    }

    pub fn peer_set(&self, id: ChannelId) -> Option<&BTreeSet<HostId>> {
        self.channels.get(&id).map(|channel| &channel.peers)
    }

    /// Stop accepting replication writes. Channels remain readable so
    /// snapshots and drains can finish.
    pub fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DEFAULT_CHANNEL;

    fn hub() -> ReplicationHub {
        let mut hub = ReplicationHub::new(
            HostId::new(1).unwrap(),
            TransportConfig::default(),
            Limits::default(),
        );
        hub.create_channel(DEFAULT_CHANNEL, Box::new(LogMap::new()));
        hub
    }

    fn change(origin: u8, seq: u64) -> ReplicatedChange {
        ReplicatedChange::new(
            DEFAULT_CHANNEL,
            HostId::new(origin).unwrap(),
            seq,
            Bytes::from_static(b"delta"),
        )
    }

    #[test]
    fn channel_is_idempotent_per_id() {
        let mut hub = hub();
        hub.channel(DEFAULT_CHANNEL).peers.insert(HostId::new(9).unwrap());
        assert!(hub.channel(DEFAULT_CHANNEL).peers().contains(&HostId::new(9).unwrap()));
        assert_eq!(hub.channels.len(), 1);
    }

    #[test]
    fn unknown_channel_is_rejected_not_created() {
        let mut hub = hub();
        let unknown = ChannelId::new(9).unwrap();
        let frame = ReplicatedChange::new(unknown, HostId::new(2).unwrap(), 1, Bytes::new());
        assert_eq!(
            hub.route_inbound(frame),
            Err(RouteError::UnknownChannel(unknown))
        );
        assert!(!hub.contains(unknown));
    }

    #[test]
    fn duplicate_redelivery_is_idempotent() {
        let mut hub = hub();
        assert!(matches!(
            hub.route_inbound(change(2, 1)).unwrap(),
            RouteOutcome::Applied(_)
        ));
        assert_eq!(hub.route_inbound(change(2, 1)).unwrap(), RouteOutcome::Duplicate);
        assert_eq!(hub.channel_ref(DEFAULT_CHANNEL).unwrap().snapshot().len(), 1);
    }

    #[test]
    fn own_origin_changes_are_never_reapplied() {
        let mut hub = hub();
        assert_eq!(hub.route_inbound(change(1, 1)).unwrap(), RouteOutcome::OwnOrigin);
        assert!(hub.channel_ref(DEFAULT_CHANNEL).unwrap().snapshot().is_empty());
    }

    #[test]
    fn out_of_order_delivery_applies_in_origin_order() {
        let mut hub = hub();
        assert!(matches!(
            hub.route_inbound(change(2, 2)).unwrap(),
            RouteOutcome::Buffered { missing_from: 1 }
        ));
        let outcome = hub.route_inbound(change(2, 1)).unwrap();
        match outcome {
            RouteOutcome::Applied(batch) => {
                assert_eq!(batch.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn bind_peer_bootstraps_existing_state_excluding_the_peer_itself() {
        let mut hub = hub();
        hub.publish_local(DEFAULT_CHANNEL, Bytes::from_static(b"local")).unwrap();
        hub.route_inbound(change(3, 1)).unwrap();

        let bootstrap = hub.bind_peer(HostId::new(3).unwrap());
        assert_eq!(bootstrap.len(), 1);
        assert_eq!(bootstrap[0].origin, HostId::new(1).unwrap());
        assert!(
            hub.peer_set(DEFAULT_CHANNEL)
                .unwrap()
                .contains(&HostId::new(3).unwrap())
        );

        hub.release_peer(HostId::new(3).unwrap());
        assert!(hub.peer_set(DEFAULT_CHANNEL).unwrap().is_empty());
    }

    #[test]
    fn local_publishes_are_sequenced_from_one() {
        let mut hub = hub();
        let first = hub.publish_local(DEFAULT_CHANNEL, Bytes::new()).unwrap();
        let second = hub.publish_local(DEFAULT_CHANNEL, Bytes::new()).unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.origin, HostId::new(1).unwrap());
    }

    #[test]
    fn closed_hub_rejects_writes_but_keeps_snapshots() {
        let mut hub = hub();
        hub.publish_local(DEFAULT_CHANNEL, Bytes::new()).unwrap();
        hub.close();
        assert_eq!(
            hub.publish_local(DEFAULT_CHANNEL, Bytes::new()),
            Err(RouteError::Closed)
        );
        assert_eq!(hub.route_inbound(change(2, 1)), Err(RouteError::Closed));
        assert_eq!(hub.channel_ref(DEFAULT_CHANNEL).unwrap().snapshot().len(), 1);
    }
}
