//! Central error types for the Habana AI operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Central error type for the Habana AI operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer-related error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The DeviceConfig selects nodes already selected by another DeviceConfig
    #[error("Conflicting DeviceConfig NodeSelectors found for {name}: {details}")]
    NodeSelectorConflict { name: String, details: String },

    /// A sub-reconciler of the normal path failed
    #[error("{stage} reconciliation failed: {source}")]
    StageFailed {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Child resource cleanup failed on the deletion path
    #[error("failed to delete DeviceConfig resources: {0}")]
    CleanupFailed(#[source] Box<Error>),

    /// An object handed to a builder does not belong to the DeviceConfig
    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Whether the API server rejected a write with a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Check if this error type should trigger a quick retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::FinalizerError(_) => true,
            Error::StageFailed { source, .. } => source.is_retriable(),
            Error::CleanupFailed(source) => source.is_retriable(),
            _ => false,
        }
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::StageFailed { source, .. } => source.status_message(),
            Error::NodeSelectorConflict { details, .. } => {
                format!("Conflicting DeviceConfig NodeSelectors found: {}", details)
            }
            _ => self.to_string(),
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::KubeError(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, message: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: match code {
            404 => "NotFound",
            409 => "Conflict",
            503 => "ServiceUnavailable",
            _ => "InternalError",
        }
        .to_string(),
        code,
    }))
}
