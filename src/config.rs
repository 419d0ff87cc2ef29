//! Node configuration loading and validation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{HostId, Limits};
use crate::net::WireFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// Transport options recognized by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Listening port; 0 requests an ephemeral port.
    pub port: u16,
    /// Cadence of outbound heartbeat frames.
    pub heartbeat_interval_ms: u64,
    /// Wire format for connections this node initiates; accepted
    /// connections infer theirs from the peer.
    pub wire: WireFormat,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 0,
            heartbeat_interval_ms: 1_000,
            wire: WireFormat::Text,
        }
    }
}

/// A cluster peer this node should replicate with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub host_id: u8,
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Session name this node presents in handshakes.
    pub name: String,
    /// This node's position in the cluster membership record; seeds the
    /// asset tree's host identity.
    pub host_id: u8,
    pub transport: TransportConfig,
    /// Idle window after which a silent connection is declared dead.
    pub heartbeat_timeout_ms: u64,
    pub limits: Limits,
    pub peers: Vec<PeerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host_id: 1,
            transport: TransportConfig::default(),
            heartbeat_timeout_ms: 20_000,
            limits: Limits::default(),
            peers: Vec::new(),
        }
    }
}

fn default_name() -> String {
    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());
    format!("{}@{}", whoami::username(), hostname)
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: NodeConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(source),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn host(&self) -> Result<HostId, ConfigError> {
        HostId::new(self.host_id).map_err(|err| ConfigError::Invalid {
            reason: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "name must not be empty".into(),
            });
        }
        let host = self.host()?;
        if self.transport.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                reason: "transport.heartbeat_interval_ms must be nonzero".into(),
            });
        }
        if self.heartbeat_timeout_ms < self.transport.heartbeat_interval_ms {
            return Err(ConfigError::Invalid {
                reason: "heartbeat_timeout_ms must not be shorter than the interval".into(),
            });
        }
        if self.limits.max_frame_bytes < 1024 {
            return Err(ConfigError::Invalid {
                reason: "limits.max_frame_bytes must be at least 1024".into(),
            });
        }
        if self.limits.max_connections == 0 {
            return Err(ConfigError::Invalid {
                reason: "limits.max_connections must be nonzero".into(),
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.peers {
            if peer.host_id == host.get() {
                return Err(ConfigError::Invalid {
                    reason: format!("peer host id {} collides with this node", peer.host_id),
                });
            }
            if peer.host_id == 0 {
                return Err(ConfigError::Invalid {
                    reason: "peer host id must be nonzero".into(),
                });
            }
            if !seen.insert(peer.host_id) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate peer host id {}", peer.host_id),
                });
            }
            if peer.addr.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("peer {} has an empty address", peer.host_id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_validate() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_roundtrip_preserves_the_config() {
        let mut config = NodeConfig::default();
        config.name = "node-a".into();
        config.host_id = 3;
        config.transport.port = 8085;
        config.peers.push(PeerConfig {
            host_id: 2,
            addr: "10.0.0.2:8085".into(),
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbor.toml");
        let rendered = toml::to_string_pretty(&config).unwrap();
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn timeout_shorter_than_interval_is_rejected() {
        let config = NodeConfig {
            heartbeat_timeout_ms: 10,
            ..NodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn peer_collisions_are_rejected() {
        let mut config = NodeConfig::default();
        config.peers.push(PeerConfig {
            host_id: config.host_id,
            addr: "10.0.0.1:1".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));

        config.peers.clear();
        config.peers.push(PeerConfig {
            host_id: 2,
            addr: "a:1".into(),
        });
        config.peers.push(PeerConfig {
            host_id: 2,
            addr: "b:1".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
