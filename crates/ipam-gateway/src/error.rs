//! Gateway errors

use thiserror::Error;

/// Errors that can occur when reading or writing cluster resources
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource (or the record inside it) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource is present but malformed for our purposes
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Whether the error means "already gone".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Wraps a client error, turning an API 404 into `NotFound(what)`.
    pub fn from_kube(error: kube::Error, what: impl FnOnce() -> String) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(what()),
            other => Self::Kube(other),
        }
    }
}
