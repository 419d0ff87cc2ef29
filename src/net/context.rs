//! Per-connection negotiated state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ConnId, HostId};

use super::publisher::WirePublisher;
use super::stats::ConnectionObserver;
use super::wire::WireFormat;

/// How session identity was established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    /// A HEADER frame was exchanged.
    Header,
    /// A trusted replication peer skipped the header; identity came from the
    /// first frame's origin.
    TrustedPeer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDetails {
    pub name: String,
    pub host_id: Option<HostId>,
    pub security_token: Option<String>,
    pub via: HandshakeKind,
}

impl SessionDetails {
    pub fn trusted_peer(origin: HostId) -> Self {
        Self {
            name: format!("peer-{origin}"),
            host_id: Some(origin),
            security_token: None,
            via: HandshakeKind::TrustedPeer,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("session already bound on {conn}")]
pub struct SessionRebind {
    pub conn: ConnId,
}

/// Mutable state for one live socket.
///
/// Created at accept time with the wire format unset; the wire format and
/// session details are bound exactly once when the handshake completes.
pub struct ConnectionContext {
    conn_id: ConnId,
    wire: Option<WireFormat>,
    session: Option<SessionDetails>,
    heartbeat_timeout_ms: u64,
    publisher: WirePublisher,
    observer: Arc<dyn ConnectionObserver>,
}

impl ConnectionContext {
    pub fn new(
        conn_id: ConnId,
        heartbeat_timeout_ms: u64,
        publisher: WirePublisher,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            conn_id,
            wire: None,
            session: None,
            heartbeat_timeout_ms,
            publisher,
            observer,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn wire(&self) -> Option<WireFormat> {
        self.wire
    }

    pub fn session(&self) -> Option<&SessionDetails> {
        self.session.as_ref()
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms
    }

    pub fn set_heartbeat_timeout(&mut self, timeout_ms: u64) {
        self.heartbeat_timeout_ms = timeout_ms;
    }

    pub fn publisher(&self) -> &WirePublisher {
        &self.publisher
    }

    pub fn observer(&self) -> &Arc<dyn ConnectionObserver> {
        &self.observer
    }

    /// Bind the handshake outcome. A second bind is a logic error and is
    /// rejected rather than silently overwriting the session.
    pub fn bind_session(
        &mut self,
        details: SessionDetails,
        wire: WireFormat,
    ) -> Result<(), SessionRebind> {
        if self.session.is_some() {
            return Err(SessionRebind { conn: self.conn_id });
        }
        self.session = Some(details);
        self.wire = Some(wire);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::publisher::publisher_pair;
    use crate::net::stats::LogObserver;

    fn context() -> ConnectionContext {
        let (publisher, _queue) = publisher_pair();
        ConnectionContext::new(ConnId::new(1), 20_000, publisher, Arc::new(LogObserver::new()))
    }

    #[test]
    fn session_binds_exactly_once() {
        let mut ctx = context();
        assert!(ctx.session().is_none());
        assert!(ctx.wire().is_none());

        let details = SessionDetails::trusted_peer(HostId::new(4).unwrap());
        ctx.bind_session(details.clone(), WireFormat::Binary).unwrap();
        assert_eq!(ctx.session(), Some(&details));
        assert_eq!(ctx.wire(), Some(WireFormat::Binary));

        let again = ctx.bind_session(details, WireFormat::Text);
        assert_eq!(again, Err(SessionRebind { conn: ConnId::new(1) }));
        assert_eq!(ctx.wire(), Some(WireFormat::Binary));
    }

    #[test]
    fn heartbeat_override_applies() {
        let mut ctx = context();
        ctx.set_heartbeat_timeout(5_000);
        assert_eq!(ctx.heartbeat_timeout_ms(), 5_000);
    }
}
