//! Per-node cluster context: defaults and the connection pipeline builder.

use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::config::{NodeConfig, TransportConfig};
use crate::core::{ConnId, HostId, Limits};
use crate::net::{
    ConnRole, ConnectionContext, ConnectionObserver, ConnectionPipeline, HandlerFactory,
    LocalIdentity, LogObserver, WireFormat, WirePublisher,
};
use crate::tree::{AssetTree, TreeError};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid cluster context: {reason}")]
    Invalid { reason: String },
    #[error("asset tree already bound")]
    TreeAlreadyBound,
    #[error("asset tree not bound")]
    TreeNotBound,
    #[error("handler factory not installed")]
    HandlerFactoryMissing,
    #[error(transparent)]
    Tree(#[from] TreeError),
}

struct TreeBinding {
    tree: Arc<dyn AssetTree>,
    host_id: HostId,
}

/// Node-wide connection defaults plus the three-layer pipeline builder.
///
/// Created once at startup and read-only thereafter, except for the asset
/// tree (bound once when the tree is attached) and the handler factory
/// (installed once by the server endpoint).
pub struct ClusterContext {
    name: String,
    default_wire: WireFormat,
    heartbeat_timeout_ms: u64,
    transport: TransportConfig,
    limits: Limits,
    observer: Arc<dyn ConnectionObserver>,
    tree: OnceLock<TreeBinding>,
    handler_factory: OnceLock<HandlerFactory>,
}

impl ClusterContext {
    pub fn builder() -> ClusterContextBuilder {
        ClusterContextBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_wire(&self) -> WireFormat {
        self.default_wire
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_timeout_ms
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn observer(&self) -> Arc<dyn ConnectionObserver> {
        Arc::clone(&self.observer)
    }

    /// Attach the resource tree this node serves. Derives the node's host
    /// identity from the tree's cluster membership record.
    pub fn bind_tree(&self, tree: Arc<dyn AssetTree>) -> Result<HostId, ContextError> {
        let host_id = tree.host_identity()?;
        self.tree
            .set(TreeBinding { tree, host_id })
            .map_err(|_| ContextError::TreeAlreadyBound)?;
        Ok(host_id)
    }

    pub fn host_id(&self) -> Result<HostId, ContextError> {
        self.tree
            .get()
            .map(|binding| binding.host_id)
            .ok_or(ContextError::TreeNotBound)
    }

    pub fn tree(&self) -> Result<Arc<dyn AssetTree>, ContextError> {
        self.tree
            .get()
            .map(|binding| Arc::clone(&binding.tree))
            .ok_or(ContextError::TreeNotBound)
    }

    /// Installed once by the server endpoint when the event loop exists.
    /// A second install is ignored.
    pub fn install_handler_factory(&self, factory: HandlerFactory) {
        let _ = self.handler_factory.set(factory);
    }

    /// Compose the per-connection pipeline: sniffing, then handshake, then
    /// the lazily built dispatch delegate.
    pub fn build_pipeline(
        &self,
        role: ConnRole,
        conn_id: ConnId,
        publisher: WirePublisher,
    ) -> Result<ConnectionPipeline, ContextError> {
        let factory = self
            .handler_factory
            .get()
            .cloned()
            .ok_or(ContextError::HandlerFactoryMissing)?;
        let host_id = self.host_id()?;
        let ctx = ConnectionContext::new(
            conn_id,
            self.heartbeat_timeout_ms,
            publisher,
            self.observer(),
        );
        let local = LocalIdentity {
            name: self.name.clone(),
            host_id,
        };
        // Acceptor-side connections infer the wire format from the peer;
        // connections we initiate publish in the node default.
        let initiated_wire = match role {
            ConnRole::Accepted => None,
            ConnRole::Initiated => Some(self.default_wire),
        };
        Ok(ConnectionPipeline::new(
            role,
            ctx,
            factory,
            local,
            initiated_wire,
        ))
    }
}

/// Explicit builder with eager validation.
pub struct ClusterContextBuilder {
    name: String,
    default_wire: WireFormat,
    heartbeat_timeout_ms: u64,
    transport: TransportConfig,
    limits: Limits,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl ClusterContextBuilder {
    /// Node-wide defaults; override before `build`.
    pub fn new() -> Self {
        Self {
            name: String::new(),
            default_wire: WireFormat::Text,
            heartbeat_timeout_ms: 20_000,
            transport: TransportConfig::default(),
            limits: Limits::default(),
            observer: None,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            name: config.name.clone(),
            default_wire: config.transport.wire,
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            transport: config.transport.clone(),
            limits: config.limits.clone(),
            observer: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn default_wire(mut self, wire: WireFormat) -> Self {
        self.default_wire = wire;
        self
    }

    pub fn heartbeat_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<ClusterContext, ContextError> {
        if self.name.is_empty() {
            return Err(ContextError::Invalid {
                reason: "node name must not be empty".into(),
            });
        }
        if self.heartbeat_timeout_ms == 0 {
            return Err(ContextError::Invalid {
                reason: "heartbeat timeout must be nonzero".into(),
            });
        }
        if self.transport.heartbeat_interval_ms == 0 {
            return Err(ContextError::Invalid {
                reason: "heartbeat interval must be nonzero".into(),
            });
        }
        if self.heartbeat_timeout_ms < self.transport.heartbeat_interval_ms {
            return Err(ContextError::Invalid {
                reason: "heartbeat timeout must not be shorter than the interval".into(),
            });
        }
        if self.limits.max_frame_bytes < 1024 {
            return Err(ContextError::Invalid {
                reason: "max_frame_bytes must be at least 1024".into(),
            });
        }
        if self.limits.max_connections == 0 {
            return Err(ContextError::Invalid {
                reason: "max_connections must be nonzero".into(),
            });
        }
        Ok(ClusterContext {
            name: self.name,
            default_wire: self.default_wire,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            transport: self.transport,
            limits: self.limits,
            observer: self
                .observer
                .unwrap_or_else(|| Arc::new(LogObserver::new())),
            tree: OnceLock::new(),
            handler_factory: OnceLock::new(),
        })
    }
}

impl Default for ClusterContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemoryTree;

    #[test]
    fn builder_rejects_empty_name_and_bad_heartbeats() {
        assert!(matches!(
            ClusterContext::builder().build(),
            Err(ContextError::Invalid { .. })
        ));
        assert!(matches!(
            ClusterContext::builder()
                .name("node")
                .heartbeat_timeout_ms(0)
                .build(),
            Err(ContextError::Invalid { .. })
        ));
        let short_timeout = ClusterContext::builder()
            .name("node")
            .heartbeat_timeout_ms(10)
            .build();
        assert!(matches!(short_timeout, Err(ContextError::Invalid { .. })));
    }

    #[test]
    fn tree_binds_once_and_derives_host_identity() {
        let context = ClusterContext::builder().name("node").build().unwrap();
        assert!(matches!(context.host_id(), Err(ContextError::TreeNotBound)));

        let tree = Arc::new(MemoryTree::new(HostId::new(4).unwrap()));
        let host = context.bind_tree(tree.clone()).unwrap();
        assert_eq!(host, HostId::new(4).unwrap());
        assert_eq!(context.host_id().unwrap(), host);

        assert!(matches!(
            context.bind_tree(tree),
            Err(ContextError::TreeAlreadyBound)
        ));
    }

    #[test]
    fn pipeline_needs_tree_and_factory() {
        let context = ClusterContext::builder().name("node").build().unwrap();
        let (publisher, _queue) = crate::net::publisher_pair();
        assert!(matches!(
            context.build_pipeline(ConnRole::Accepted, ConnId::new(1), publisher),
            Err(ContextError::HandlerFactoryMissing)
        ));
    }
}
