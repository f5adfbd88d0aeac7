//! Error types for the control plane.

use rackpool_types::HostId;
use thiserror::Error;

use crate::hsm::HostState;

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The host id is not present in the registry.
    #[error("host {0} is not registered")]
    UnknownHost(HostId),

    /// An operation arrived in a state it is not defined for.
    #[error("{operation} is invalid in state {state}")]
    UnexpectedState {
        operation: &'static str,
        state: HostState,
    },

    /// The tunables overlay could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// The TIMEOUTS map names a state that has no configurable timeout.
    #[error("unknown timeout state: {0:?}")]
    UnknownTimeoutState(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, PoolError>;
