//! The node's event loop.
//!
//! One dedicated thread owns the replication hub and the live-connection
//! registry; everything else talks to it through `LoopHandle`. That makes
//! the loop thread the single writer for all hub and channel state, and it
//! is where replication fan-out originates: cross-connection traffic is
//! enqueued on the target connection's publisher, never written inline.

use std::collections::BTreeMap;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;

use crate::cluster::hub::{ReplicationHub, RouteError, RouteOutcome};
use crate::cluster::map::ReplicatedMap;
use crate::core::{ChannelId, ConnId, ErrorCode, ErrorPayload, HostId, ReplicatedChange};
use crate::net::proto::{ChannelFrame, NodeMessage};
use crate::net::publisher::WirePublisher;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event loop is gone")]
pub struct LoopGone;

pub enum LoopEvent {
    /// A connection came up; register its publisher for fan-out and error
    /// replies.
    ConnOpened {
        conn: ConnId,
        publisher: WirePublisher,
    },
    /// Handshake bound a cluster host id to the connection.
    PeerBound { conn: ConnId, host: HostId },
    /// Inbound replication frame from `conn`.
    Apply { conn: ConnId, frame: ChannelFrame },
    /// Locally produced change.
    PublishLocal {
        channel: ChannelId,
        payload: Bytes,
        respond: Sender<Result<ReplicatedChange, RouteError>>,
    },
    /// Provision a channel ahead of traffic.
    CreateChannel {
        channel: ChannelId,
        map: Box<dyn ReplicatedMap>,
        respond: Sender<()>,
    },
    /// Read a channel's replicated-map state.
    Snapshot {
        channel: ChannelId,
        respond: Sender<Option<Vec<ReplicatedChange>>>,
    },
    /// The channel provider is closing: reject new replication writes while
    /// queued work drains.
    CloseProvider { respond: Sender<()> },
    /// A connection went away; release its peer slot.
    ConnClosed { conn: ConnId },
    Shutdown,
}

#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<LoopEvent>,
}

impl LoopHandle {
    pub fn send(&self, event: LoopEvent) -> Result<(), LoopGone> {
        self.tx.send(event).map_err(|_| LoopGone)
    }

    /// Synchronous request/response against the loop thread.
    pub fn request<T>(&self, build: impl FnOnce(Sender<T>) -> LoopEvent) -> Result<T, LoopGone> {
        let (tx, rx) = bounded(1);
        self.send(build(tx))?;
        rx.recv().map_err(|_| LoopGone)
    }
}

/// Owned loop resource: spawned by the server endpoint at start, stopped
/// after the channel provider closes, which in turn closes every connection.
pub struct EventLoop {
    handle: LoopHandle,
    join: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn spawn(hub: ReplicationHub) -> Self {
        let (tx, rx) = unbounded();
        let join = std::thread::Builder::new()
            .name("arbor-loop".into())
            .spawn(move || run_loop(rx, hub))
            .expect("spawn event loop thread");
        Self {
            handle: LoopHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Idempotent: the second stop is a no-op.
    pub fn stop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.send(LoopEvent::Shutdown);
            let _ = join.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConnEntry {
    publisher: WirePublisher,
    host: Option<HostId>,
}

fn run_loop(rx: Receiver<LoopEvent>, mut hub: ReplicationHub) {
    let mut conns: BTreeMap<ConnId, ConnEntry> = BTreeMap::new();

    while let Ok(event) = rx.recv() {
        match event {
            LoopEvent::ConnOpened { conn, publisher } => {
                conns.insert(
                    conn,
                    ConnEntry {
                        publisher,
                        host: None,
                    },
                );
            }
            LoopEvent::PeerBound { conn, host } => {
                let bootstrap = hub.bind_peer(host);
                if let Some(entry) = conns.get_mut(&conn) {
                    entry.host = Some(host);
                    for change in bootstrap {
                        let frame = ChannelFrame::from(change);
                        if entry.publisher.enqueue(NodeMessage::Channel(frame)).is_err() {
                            break;
                        }
                    }
                }
            }
            LoopEvent::Apply { conn, frame } => {
                apply_inbound(&mut hub, &conns, conn, frame);
            }
            LoopEvent::PublishLocal {
                channel,
                payload,
                respond,
            } => {
                let result = hub.publish_local(channel, payload);
                if let Ok(change) = &result {
                    fan_out(&conns, &hub, std::slice::from_ref(change), None);
                }
                let _ = respond.send(result);
            }
            LoopEvent::CreateChannel {
                channel,
                map,
                respond,
            } => {
                hub.create_channel(channel, map);
                let _ = respond.send(());
            }
            LoopEvent::Snapshot { channel, respond } => {
                let snapshot = hub.channel_ref(channel).map(|ch| ch.snapshot());
                let _ = respond.send(snapshot);
            }
            LoopEvent::CloseProvider { respond } => {
                hub.close();
                let _ = respond.send(());
            }
            LoopEvent::ConnClosed { conn } => {
                if let Some(entry) = conns.remove(&conn)
                    && let Some(host) = entry.host
                {
                    hub.release_peer(host);
                }
            }
            LoopEvent::Shutdown => break,
        }
    }

    // Closing the publishers lets each session thread drain its queue and
    // shut its socket down.
    for entry in conns.values() {
        entry.publisher.close();
    }
}

fn apply_inbound(
    hub: &mut ReplicationHub,
    conns: &BTreeMap<ConnId, ConnEntry>,
    conn: ConnId,
    frame: ChannelFrame,
) {
    let channel = frame.channel;
    match hub.route_inbound(ReplicatedChange::from(frame)) {
        Ok(RouteOutcome::Applied(batch)) => fan_out(conns, hub, &batch, Some(conn)),
        Ok(RouteOutcome::Duplicate) | Ok(RouteOutcome::OwnOrigin) => {
            tracing::trace!(%conn, %channel, "replication frame was a no-op");
        }
        Ok(RouteOutcome::Buffered { missing_from }) => {
            tracing::debug!(%conn, %channel, missing_from, "replication frame buffered");
        }
        Ok(RouteOutcome::Overflow) => {
            reply_error(
                conns,
                conn,
                ErrorPayload::new(
                    ErrorCode::Overloaded,
                    format!("reorder buffer full on channel {channel}"),
                    true,
                ),
            );
        }
        Err(RouteError::UnknownChannel(id)) => {
            // Per-frame rejection: the connection stays open.
            reply_error(
                conns,
                conn,
                ErrorPayload::new(ErrorCode::UnknownChannel, format!("unknown channel id {id}"), false),
            );
        }
        Err(RouteError::Closed) => {
            reply_error(
                conns,
                conn,
                ErrorPayload::new(ErrorCode::ShuttingDown, "replication writes are draining", true),
            );
        }
    }
}

fn reply_error(conns: &BTreeMap<ConnId, ConnEntry>, conn: ConnId, payload: ErrorPayload) {
    tracing::debug!(%conn, code = %payload.code, "rejecting replication frame: {}", payload.message);
    if let Some(entry) = conns.get(&conn) {
        let _ = entry.publisher.enqueue(NodeMessage::Error(payload));
    }
}

/// Forward applied changes to every other live peer replicating their
/// channel, skipping the connection they arrived on and any connection bound
/// to the change's origin.
fn fan_out(
    conns: &BTreeMap<ConnId, ConnEntry>,
    hub: &ReplicationHub,
    changes: &[ReplicatedChange],
    source: Option<ConnId>,
) {
    for change in changes {
        let Some(peers) = hub.peer_set(change.channel) else {
            continue;
        };
        for (conn, entry) in conns {
            let Some(host) = entry.host else {
                continue;
            };
            if Some(*conn) == source || host == change.origin || !peers.contains(&host) {
                continue;
            }
            let frame = ChannelFrame::from(change.clone());
            if entry.publisher.enqueue(NodeMessage::Channel(frame)).is_err() {
                tracing::debug!(%conn, "fan-out skipped: publisher closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::map::LogMap;
    use crate::config::TransportConfig;
    use crate::core::{DEFAULT_CHANNEL, Limits};
    use crate::net::publisher::publisher_pair;

    fn spawn_loop() -> EventLoop {
        let mut hub = ReplicationHub::new(
            HostId::new(1).unwrap(),
            TransportConfig::default(),
            Limits::default(),
        );
        hub.create_channel(DEFAULT_CHANNEL, Box::new(LogMap::new()));
        EventLoop::spawn(hub)
    }

    #[test]
    fn publish_local_applies_and_snapshots() {
        let mut event_loop = spawn_loop();
        let handle = event_loop.handle();

        let change = handle
            .request(|respond| LoopEvent::PublishLocal {
                channel: DEFAULT_CHANNEL,
                payload: Bytes::from_static(b"v"),
                respond,
            })
            .unwrap()
            .unwrap();
        assert_eq!(change.seq, 1);

        let snapshot = handle
            .request(|respond| LoopEvent::Snapshot {
                channel: DEFAULT_CHANNEL,
                respond,
            })
            .unwrap()
            .unwrap();
        assert_eq!(snapshot, vec![change]);

        event_loop.stop();
    }

    #[test]
    fn provider_close_rejects_new_writes() {
        let mut event_loop = spawn_loop();
        let handle = event_loop.handle();

        handle
            .request(|respond| LoopEvent::CloseProvider { respond })
            .unwrap();
        let result = handle
            .request(|respond| LoopEvent::PublishLocal {
                channel: DEFAULT_CHANNEL,
                payload: Bytes::new(),
                respond,
            })
            .unwrap();
        assert_eq!(result, Err(RouteError::Closed));

        event_loop.stop();
    }

    #[test]
    fn bound_peer_receives_bootstrap_and_fan_out() {
        let mut event_loop = spawn_loop();
        let handle = event_loop.handle();

        handle
            .request(|respond| LoopEvent::PublishLocal {
                channel: DEFAULT_CHANNEL,
                payload: Bytes::from_static(b"existing"),
                respond,
            })
            .unwrap()
            .unwrap();

        let (publisher, queue) = publisher_pair();
        let conn = ConnId::new(1);
        handle
            .send(LoopEvent::ConnOpened {
                conn,
                publisher,
            })
            .unwrap();
        handle
            .send(LoopEvent::PeerBound {
                conn,
                host: HostId::new(2).unwrap(),
            })
            .unwrap();

        handle
            .request(|respond| LoopEvent::PublishLocal {
                channel: DEFAULT_CHANNEL,
                payload: Bytes::from_static(b"new"),
                respond,
            })
            .unwrap()
            .unwrap();

        // Bootstrap frame (seq 1) then fanned-out frame (seq 2).
        let frames = queue.drain();
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            &frames[0],
            NodeMessage::Channel(frame) if frame.seq == 1
        ));
        assert!(matches!(
            &frames[1],
            NodeMessage::Channel(frame) if frame.seq == 2
        ));

        event_loop.stop();
    }

    #[test]
    fn unknown_channel_frame_is_answered_with_an_error() {
        let mut event_loop = spawn_loop();
        let handle = event_loop.handle();

        let (publisher, queue) = publisher_pair();
        let conn = ConnId::new(3);
        handle.send(LoopEvent::ConnOpened { conn, publisher }).unwrap();
        handle
            .send(LoopEvent::Apply {
                conn,
                frame: ChannelFrame {
                    channel: ChannelId::new(42).unwrap(),
                    origin: HostId::new(2).unwrap(),
                    seq: 1,
                    payload: Bytes::new(),
                },
            })
            .unwrap();

        // Synchronize on the loop before inspecting the queue.
        handle
            .request(|respond| LoopEvent::Snapshot {
                channel: DEFAULT_CHANNEL,
                respond,
            })
            .unwrap();

        match queue.drain().as_slice() {
            [NodeMessage::Error(payload)] => {
                assert_eq!(payload.code, ErrorCode::UnknownChannel);
            }
            other => panic!("unexpected frames: {other:?}"),
        }

        event_loop.stop();
    }
}
