//! Cluster layer: node context, replication hub, channel routing.

pub mod context;
pub mod hub;
pub mod map;
pub mod stream;

pub use context::{ClusterContext, ClusterContextBuilder, ContextError};
pub use hub::{Channel, ReplicationHub, RouteError, RouteOutcome};
pub use map::{LogMap, MapApplyError, ReplicatedMap};
pub use stream::{IngestOutcome, OriginStream};
