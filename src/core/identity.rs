//! Identity atoms.
//!
//! HostId: one byte, unique per cluster node, tags the origin of every
//! replicated change.
//! ChannelId: short integer addressing one replicated map within a hub.
//! ConnId: process-local connection counter, never leaves the wire boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::IdentityError;

/// Cluster node identifier.
///
/// Zero is reserved; a valid id is 1..=255. No two live nodes in the same
/// cluster may share one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct HostId(u8);

impl HostId {
    pub fn new(raw: u8) -> Result<Self, IdentityError> {
        if raw == 0 {
            Err(IdentityError::ZeroHostId)
        } else {
            Ok(Self(raw))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for HostId {
    type Error = IdentityError;

    fn try_from(raw: u8) -> Result<Self, IdentityError> {
        Self::new(raw)
    }
}

impl From<HostId> for u8 {
    fn from(id: HostId) -> u8 {
        id.0
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.0)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication channel identifier.
///
/// Zero is reserved. Channel 1 is the conventional default map created at
/// node startup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct ChannelId(u16);

/// The channel every node provisions at startup.
pub const DEFAULT_CHANNEL: ChannelId = ChannelId(1);

impl ChannelId {
    pub fn new(raw: u16) -> Result<Self, IdentityError> {
        if raw == 0 {
            Err(IdentityError::ZeroChannelId)
        } else {
            Ok(Self(raw))
        }
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for ChannelId {
    type Error = IdentityError;

    fn try_from(raw: u16) -> Result<Self, IdentityError> {
        Self::new(raw)
    }
}

impl From<ChannelId> for u16 {
    fn from(id: ChannelId) -> u16 {
        id.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local connection identifier, monotonically assigned at accept or
/// connect time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId({})", self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_host_id_is_rejected() {
        assert!(matches!(HostId::new(0), Err(IdentityError::ZeroHostId)));
        assert_eq!(HostId::new(7).unwrap().get(), 7);
    }

    #[test]
    fn zero_channel_id_is_rejected() {
        assert!(matches!(
            ChannelId::new(0),
            Err(IdentityError::ZeroChannelId)
        ));
        assert_eq!(DEFAULT_CHANNEL.get(), 1);
    }

    #[test]
    fn host_id_serde_enforces_nonzero() {
        let ok: HostId = serde_json::from_str("3").unwrap();
        assert_eq!(ok.get(), 3);
        assert!(serde_json::from_str::<HostId>("0").is_err());
    }
}
