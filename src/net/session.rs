//! Per-connection handshake state machine.
//!
//! `AwaitingFormat → AwaitingHandshake → Dispatching`. The dispatch delegate
//! is constructed lazily, only once the handshake (or the trusted-peer
//! bypass) has bound session details, because its behaviour may depend on
//! the negotiated session.

use std::sync::Arc;

use rand::Rng;

use crate::core::{ConnId, ErrorCode, ErrorPayload};

use super::context::{ConnectionContext, SessionDetails};
use super::proto::{Header, NodeMessage};
use super::wire::WireFormat;

/// Post-handshake message consumer bound to one connection.
pub trait FrameHandler: Send {
    fn on_message(&mut self, msg: NodeMessage, ctx: &mut ConnectionContext)
    -> Vec<PipelineAction>;
}

/// Builds the dispatch delegate once session details are known.
pub type HandlerFactory =
    Arc<dyn Fn(&SessionDetails, ConnId) -> Box<dyn FrameHandler> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnRole {
    Accepted,
    Initiated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnPhase {
    AwaitingFormat,
    AwaitingHandshake,
    Dispatching,
    Closed,
}

/// What the connection loop must do next.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineAction {
    Send(NodeMessage),
    Close { error: Option<ErrorPayload> },
}

/// Identity this node presents in its own header.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub name: String,
    pub host_id: crate::core::HostId,
}

pub struct ConnectionPipeline {
    role: ConnRole,
    phase: ConnPhase,
    ctx: ConnectionContext,
    pending_wire: Option<WireFormat>,
    delegate: Option<Box<dyn FrameHandler>>,
    factory: HandlerFactory,
    local: LocalIdentity,
}

impl ConnectionPipeline {
    pub fn new(
        role: ConnRole,
        ctx: ConnectionContext,
        factory: HandlerFactory,
        local: LocalIdentity,
        initiated_wire: Option<WireFormat>,
    ) -> Self {
        let phase = match role {
            ConnRole::Accepted => ConnPhase::AwaitingFormat,
            ConnRole::Initiated => ConnPhase::AwaitingHandshake,
        };
        Self {
            role,
            phase,
            ctx,
            pending_wire: initiated_wire,
            delegate: None,
            factory,
            local,
        }
    }

    pub fn phase(&self) -> ConnPhase {
        self.phase
    }

    pub fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut ConnectionContext {
        &mut self.ctx
    }

    pub fn mark_closed(&mut self) {
        self.phase = ConnPhase::Closed;
    }

    /// Initiator side: announce ourselves right after the format marker.
    pub fn begin_handshake(&mut self) -> Vec<PipelineAction> {
        if self.role != ConnRole::Initiated || self.phase != ConnPhase::AwaitingHandshake {
            return Vec::new();
        }
        vec![PipelineAction::Send(NodeMessage::Header(
            self.local_header(),
        ))]
    }

    /// Acceptor side: the sniffer settled on a wire format.
    pub fn on_wire_classified(&mut self, format: WireFormat) -> Vec<PipelineAction> {
        if self.phase != ConnPhase::AwaitingFormat {
            return self.fail(ErrorPayload::new(
                ErrorCode::Internal,
                "wire classified twice",
                false,
            ));
        }
        self.pending_wire = Some(format);
        self.phase = ConnPhase::AwaitingHandshake;
        Vec::new()
    }

    pub fn on_message(&mut self, msg: NodeMessage) -> Vec<PipelineAction> {
        match self.phase {
            ConnPhase::AwaitingFormat => self.fail(ErrorPayload::new(
                ErrorCode::Internal,
                "frame before wire classification",
                false,
            )),
            ConnPhase::AwaitingHandshake => self.handle_first_frame(msg),
            ConnPhase::Dispatching => match msg {
                NodeMessage::Header(_) => self.fail(ErrorPayload::new(
                    ErrorCode::InvalidRequest,
                    "unexpected HEADER after handshake",
                    false,
                )),
                other => match self.delegate.as_mut() {
                    Some(delegate) => delegate.on_message(other, &mut self.ctx),
                    None => self.fail(ErrorPayload::new(
                        ErrorCode::Internal,
                        "dispatching without a delegate",
                        false,
                    )),
                },
            },
            ConnPhase::Closed => Vec::new(),
        }
    }

    fn handle_first_frame(&mut self, msg: NodeMessage) -> Vec<PipelineAction> {
        match msg {
            NodeMessage::Header(header) => self.bind_from_header(header),
            NodeMessage::Channel(frame) => {
                // Trusted peer replication connections skip the header; the
                // frame's origin is the session identity.
                let details = SessionDetails::trusted_peer(frame.origin);
                let mut actions = self.bind(details, None);
                if self.phase == ConnPhase::Dispatching
                    && let Some(delegate) = self.delegate.as_mut()
                {
                    actions.extend(delegate.on_message(NodeMessage::Channel(frame), &mut self.ctx));
                }
                actions
            }
            other => self.fail(ErrorPayload::new(
                ErrorCode::UnsupportedPayload,
                format!(
                    "unsupported payload before handshake: {}",
                    other.classification()
                ),
                false,
            )),
        }
    }

    fn bind_from_header(&mut self, header: Header) -> Vec<PipelineAction> {
        if let Some(ms) = header.heartbeat_ms {
            self.ctx.set_heartbeat_timeout(ms);
        }
        let details = SessionDetails {
            name: header.session_name,
            host_id: header.host_id,
            security_token: header.security_token,
            via: super::context::HandshakeKind::Header,
        };
        let mut actions = self.bind(details, header.wire);
        if self.phase == ConnPhase::Dispatching && self.role == ConnRole::Accepted {
            actions.push(PipelineAction::Send(NodeMessage::Header(
                self.local_header(),
            )));
        }
        actions
    }

    fn bind(
        &mut self,
        details: SessionDetails,
        wire_override: Option<WireFormat>,
    ) -> Vec<PipelineAction> {
        let Some(wire) = wire_override.or(self.pending_wire) else {
            return self.fail(ErrorPayload::new(
                ErrorCode::Internal,
                "handshake without a wire format",
                false,
            ));
        };
        if self.ctx.bind_session(details.clone(), wire).is_err() {
            return self.fail(ErrorPayload::new(
                ErrorCode::Internal,
                "session bound twice",
                false,
            ));
        }
        self.pending_wire = Some(wire);
        self.delegate = Some((self.factory)(&details, self.ctx.conn_id()));
        self.phase = ConnPhase::Dispatching;
        Vec::new()
    }

    fn fail(&mut self, payload: ErrorPayload) -> Vec<PipelineAction> {
        self.phase = ConnPhase::Closed;
        vec![PipelineAction::Close {
            error: Some(payload),
        }]
    }

    fn local_header(&self) -> Header {
        Header {
            session_name: self.local.name.clone(),
            host_id: Some(self.local.host_id),
            wire: None,
            security_token: None,
            heartbeat_ms: None,
            nonce: rand::rng().random(),
        }
    }
}
