//! Outbound message publishing.
//!
//! Each connection owns one queue. Anything outside the owning session
//! thread (replication fan-out, asset-tree replies) enqueues here instead of
//! touching the socket; the session thread drains the queue and serializes
//! in the negotiated wire format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;

use super::proto::NodeMessage;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("publisher closed")]
pub struct PublisherClosed;

/// Sending half, cloneable across threads.
#[derive(Clone)]
pub struct WirePublisher {
    tx: Sender<NodeMessage>,
    closed: Arc<AtomicBool>,
}

/// Receiving half, owned by the connection's session thread.
pub struct PublisherQueue {
    rx: Receiver<NodeMessage>,
    closed: Arc<AtomicBool>,
}

pub fn publisher_pair() -> (WirePublisher, PublisherQueue) {
    let (tx, rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    (
        WirePublisher {
            tx,
            closed: Arc::clone(&closed),
        },
        PublisherQueue { rx, closed },
    )
}

impl WirePublisher {
    /// Queue a frame for the owning connection. Rejected once close has
    /// begun; frames accepted before that still drain.
    pub fn enqueue(&self, message: NodeMessage) -> Result<(), PublisherClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PublisherClosed);
        }
        self.tx.send(message).map_err(|_| PublisherClosed)
    }

    /// Begin closing: new writes are rejected, queued writes drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl PublisherQueue {
    pub fn receiver(&self) -> &Receiver<NodeMessage> {
        &self.rx
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Everything still queued, without blocking.
    pub fn drain(&self) -> Vec<NodeMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::proto::Heartbeat;

    #[test]
    fn enqueue_after_close_is_rejected_but_queued_frames_drain() {
        let (publisher, queue) = publisher_pair();
        publisher
            .enqueue(NodeMessage::Heartbeat(Heartbeat { nonce: 1 }))
            .unwrap();
        publisher.close();
        assert_eq!(
            publisher.enqueue(NodeMessage::Heartbeat(Heartbeat { nonce: 2 })),
            Err(PublisherClosed)
        );

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_closed());
    }
}
