#![forbid(unsafe_code)]

//! A node in a clustered, replicated resource tree.
//!
//! Accepts inbound connections, sniffs the binary wire format from the
//! first bytes, negotiates session identity through a header handshake, and
//! routes decoded frames to either the hierarchical asset tree or a
//! channel-keyed replicated map shared with peer nodes.

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod net;
pub mod server;
pub mod telemetry;
pub mod tree;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers wire together.
pub use crate::cluster::{
    ClusterContext, ClusterContextBuilder, ContextError, LogMap, ReplicatedMap, ReplicationHub,
};
pub use crate::config::{NodeConfig, PeerConfig, TransportConfig};
pub use crate::core::{
    ChannelId, ConnId, DEFAULT_CHANNEL, ErrorCode, ErrorPayload, HostId, Limits, ReplicatedChange,
};
pub use crate::net::{SniffingDecoder, WireFormat};
pub use crate::server::{EndpointError, EndpointState, ServerEndpoint};
pub use crate::tree::{AssetTree, MemoryTree, TreeError};
