//! Controller-specific error types.

use crds::SelectorError;
use thiserror::Error;

/// Errors that can occur in the MachineSet controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Host selector could not be compiled
    #[error("invalid host selector: {0}")]
    Selector(#[from] SelectorError),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
