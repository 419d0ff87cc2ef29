//! Connection and protocol layer: sniffing, framing, codecs, sessions.

pub mod context;
pub mod frame;
pub mod heartbeat;
pub mod proto;
pub mod publisher;
pub mod session;
pub mod stats;
pub mod wire;

pub use context::{ConnectionContext, HandshakeKind, SessionDetails};
pub use frame::{FrameError, FrameReader, FrameWriter};
pub use heartbeat::{HeartbeatDecision, HeartbeatTracker};
pub use proto::{
    AssetFrame, ChannelFrame, Envelope, Header, Heartbeat, NodeMessage, PROTOCOL_VERSION,
    ProtoDecodeError, ProtoEncodeError, decode_envelope, encode_envelope,
};
pub use publisher::{PublisherClosed, PublisherQueue, WirePublisher, publisher_pair};
pub use session::{
    ConnPhase, ConnRole, ConnectionPipeline, FrameHandler, HandlerFactory, LocalIdentity,
    PipelineAction,
};
pub use stats::{CloseReason, ConnectionObserver, LogObserver, ThroughputSample};
pub use wire::{MARKER_LEN, Sniff, SniffingDecoder, WireFormat};
