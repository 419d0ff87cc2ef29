use thiserror::Error;

use crate::cluster::context::ContextError;
use crate::config::ConfigError;
use crate::server::EndpointError;
use crate::tree::TreeError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error: a thin wrapper over the subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Config(_) => Transience::Permanent,
            Error::Context(_) => Transience::Permanent,
            Error::Endpoint(err) => match err {
                EndpointError::Connect { .. } | EndpointError::Overloaded => Transience::Retryable,
                EndpointError::LoopGone => Transience::Unknown,
                _ => Transience::Permanent,
            },
            Error::Tree(_) => Transience::Permanent,
        }
    }
}
