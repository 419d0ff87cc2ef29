//! Asset tree collaborator boundary.
//!
//! The transport resolves this node's host identity from the tree's cluster
//! membership record and forwards asset-addressed frames to it. Storage and
//! query semantics live behind the trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use crate::core::HostId;
use crate::net::{AssetFrame, NodeMessage, WirePublisher};

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("cluster membership record has no local host identity")]
    NoLocalIdentity,
    #[error("asset request failed: {reason}")]
    Request { reason: String },
}

pub trait AssetTree: Send + Sync {
    /// This node's identity, from the tree's cluster membership record.
    fn host_identity(&self) -> Result<HostId, TreeError>;

    /// Handle one asset-addressed frame; replies go through the originating
    /// connection's publisher.
    fn handle_frame(&self, frame: AssetFrame, reply: &WirePublisher) -> Result<(), TreeError>;
}

/// Minimal in-memory tree: a flat path → payload store.
///
/// An empty payload reads the path (replying with the stored value or an
/// empty payload); a non-empty payload stores it and echoes the frame as an
/// acknowledgement.
pub struct MemoryTree {
    host: HostId,
    assets: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryTree {
    pub fn new(host: HostId) -> Self {
        Self {
            host,
            assets: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.assets.lock().ok()?.get(path).cloned()
    }
}

impl AssetTree for MemoryTree {
    fn host_identity(&self) -> Result<HostId, TreeError> {
        Ok(self.host)
    }

    fn handle_frame(&self, frame: AssetFrame, reply: &WirePublisher) -> Result<(), TreeError> {
        let response = if frame.payload.is_empty() {
            AssetFrame {
                payload: self.get(&frame.path).unwrap_or_default(),
                path: frame.path,
            }
        } else {
            let mut assets = self.assets.lock().map_err(|_| TreeError::Request {
                reason: "asset store poisoned".into(),
            })?;
            assets.insert(frame.path.clone(), frame.payload.clone());
            frame
        };
        // The connection may already be draining; a lost reply is the same
        // as a reply lost on the wire.
        let _ = reply.enqueue(NodeMessage::Asset(response));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::publisher_pair;

    #[test]
    fn memory_tree_reports_its_host_identity() {
        let tree = MemoryTree::new(HostId::new(6).unwrap());
        assert_eq!(tree.host_identity().unwrap(), HostId::new(6).unwrap());
    }

    #[test]
    fn store_then_read_roundtrips_through_the_publisher() {
        let tree = MemoryTree::new(HostId::new(1).unwrap());
        let (publisher, queue) = publisher_pair();

        tree.handle_frame(
            AssetFrame {
                path: "/a/b".into(),
                payload: Bytes::from_static(b"v1"),
            },
            &publisher,
        )
        .unwrap();

        tree.handle_frame(
            AssetFrame {
                path: "/a/b".into(),
                payload: Bytes::new(),
            },
            &publisher,
        )
        .unwrap();

        let replies = queue.drain();
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            NodeMessage::Asset(frame) => {
                assert_eq!(frame.path, "/a/b");
                assert_eq!(frame.payload, Bytes::from_static(b"v1"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn reading_a_missing_path_replies_empty() {
        let tree = MemoryTree::new(HostId::new(1).unwrap());
        let (publisher, queue) = publisher_pair();
        tree.handle_frame(
            AssetFrame {
                path: "/missing".into(),
                payload: Bytes::new(),
            },
            &publisher,
        )
        .unwrap();
        match queue.drain().as_slice() {
            [NodeMessage::Asset(frame)] => assert!(frame.payload.is_empty()),
            other => panic!("unexpected replies: {other:?}"),
        }
    }
}
