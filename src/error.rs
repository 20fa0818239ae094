//! Error types for the transport controller

use thiserror::Error;

/// Main error type for transport controller operations
///
/// User mistakes in a Binding (missing workload object, bad template) are not
/// represented here; those flow into `status.errors` as plain strings and do
/// not abort a reconcile. An `Error` value always means the reconcile itself
/// could not complete.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Failure to resolve the wrapped object kind at startup
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transport plugin failure while wrapping objects
    #[error("transport error: {0}")]
    Transport(String),
}

impl Error {
    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
