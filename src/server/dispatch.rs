//! Post-handshake message dispatch.
//!
//! One dispatcher per connection, built lazily by the handler factory once
//! session details are bound. Asset frames go to the tree collaborator;
//! channel frames go to the event loop, which owns the replication hub.

use std::sync::Arc;

use crate::core::{ConnId, ErrorCode, ErrorPayload};
use crate::net::context::ConnectionContext;
use crate::net::proto::NodeMessage;
use crate::net::session::{FrameHandler, PipelineAction};
use crate::tree::AssetTree;

use super::event_loop::{LoopEvent, LoopHandle};

pub struct NodeDispatcher {
    tree: Arc<dyn AssetTree>,
    loop_handle: LoopHandle,
    conn: ConnId,
}

impl NodeDispatcher {
    pub fn new(tree: Arc<dyn AssetTree>, loop_handle: LoopHandle, conn: ConnId) -> Self {
        Self {
            tree,
            loop_handle,
            conn,
        }
    }
}

impl FrameHandler for NodeDispatcher {
    fn on_message(
        &mut self,
        msg: NodeMessage,
        ctx: &mut ConnectionContext,
    ) -> Vec<PipelineAction> {
        match msg {
            NodeMessage::Asset(frame) => {
                match self.tree.handle_frame(frame, ctx.publisher()) {
                    Ok(()) => Vec::new(),
                    // Per-frame failure; the session stays up.
                    Err(err) => vec![PipelineAction::Send(NodeMessage::Error(
                        ErrorPayload::new(ErrorCode::InvalidRequest, err.to_string(), false),
                    ))],
                }
            }
            NodeMessage::Channel(frame) => {
                match self.loop_handle.send(LoopEvent::Apply {
                    conn: self.conn,
                    frame,
                }) {
                    Ok(()) => Vec::new(),
                    Err(_) => vec![PipelineAction::Close {
                        error: Some(ErrorPayload::new(
                            ErrorCode::ShuttingDown,
                            "node is shutting down",
                            true,
                        )),
                    }],
                }
            }
            // Arrival already reset the idle timer.
            NodeMessage::Heartbeat(_) => Vec::new(),
            NodeMessage::Error(payload) => {
                tracing::warn!(conn = %self.conn, "peer reported error: {payload}");
                vec![PipelineAction::Close { error: None }]
            }
            NodeMessage::Header(_) => vec![PipelineAction::Close {
                error: Some(ErrorPayload::new(
                    ErrorCode::InvalidRequest,
                    "unexpected HEADER after handshake",
                    false,
                )),
            }],
        }
    }
}
