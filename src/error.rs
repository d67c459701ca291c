//! Error types for the Stratus operator

use thiserror::Error;

/// Main error type for Stratus operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs or the service table
    #[error("validation error: {0}")]
    Validation(String),

    /// A child resource is already controlled by a different owner
    #[error("ownership error: {0}")]
    Ownership(String),

    /// The desired state is missing something a step requires
    #[error("malformed desired state: {0}")]
    Malformed(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an ownership error with the given message
    pub fn ownership(msg: impl Into<String>) -> Self {
        Self::Ownership(msg.into())
    }

    /// Create a malformed-desired-state error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true if this error is an optimistic-concurrency conflict
    /// from the backing store. Conflicts abort the pass cleanly and are
    /// retried on the next scheduled reconcile.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }
}
