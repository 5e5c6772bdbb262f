//! Controller-specific error types.
//!
//! This module defines error types specific to the machine controller
//! that are not covered by upstream library errors.

use crds::SelectorError;
use thiserror::Error;

use crate::userdata::UserDataError;

/// Errors that can occur in the machine controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Host selector could not be compiled
    #[error("invalid host selector: {0}")]
    Selector(#[from] SelectorError),

    /// User data fetch or merge failed
    #[error("user data error: {0}")]
    UserData(#[from] UserDataError),

    /// Bootstrap payload was not valid base64
    #[error("invalid bootstrap data: {0}")]
    Bootstrap(#[from] base64::DecodeError),

    /// Host annotation value could not be parsed
    #[error("machine {machine} has a malformed host annotation {value:?}")]
    MalformedHostKey { machine: String, value: String },

    /// Object could not be serialized for a status write
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource watch failed
    #[error("resource watch failed: {0}")]
    Watch(String),
}
