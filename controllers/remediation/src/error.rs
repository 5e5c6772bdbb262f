//! Controller-specific error types.

use thiserror::Error;

/// Errors that can occur in the remediation controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Machine is not bound to a host
    #[error("machine {0} does not have a bare metal host annotation")]
    MissingHostAnnotation(String),

    /// Node does not name its owning machine
    #[error("node {0} does not have a machine annotation")]
    MissingMachineAnnotation(String),

    /// An annotation key did not parse as "<namespace>/<name>"
    #[error("malformed namespace/name key {0:?}")]
    MalformedKey(String),

    /// Object could not be serialized for a status write
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
