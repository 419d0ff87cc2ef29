//! Core domain types: identities, limits, change records, wire errors.

pub mod change;
pub mod error;
pub mod identity;
pub mod limits;

pub use change::ReplicatedChange;
pub use error::{ErrorCode, ErrorPayload, IdentityError};
pub use identity::{ChannelId, ConnId, DEFAULT_CHANNEL, HostId};
pub use limits::Limits;
