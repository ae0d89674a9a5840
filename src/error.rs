//! Error types for the upgrade controller

use thiserror::Error;

/// Main error type for upgrade operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A cloud API call failed
    #[error("cloud error during {operation} (status {status:?}): {message}")]
    Cloud {
        /// The operation that was attempted (e.g. "get deployment")
        operation: String,
        /// HTTP status code, if the call reached the API
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// A cloud resource (deployment, scale set) does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "deployment", "scale set")
        kind: String,
        /// Resource name
        name: String,
    },

    /// The managed resource or its persisted status is malformed
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error occurred
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a cloud API error
    pub fn cloud(
        operation: impl Into<String>,
        status: Option<u16>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create a not-found error for a cloud resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// True when the error means the target resource is absent
    ///
    /// Covers both cloud-side NotFound and Kubernetes 404 responses.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Cloud { status, .. } => *status == Some(404),
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True when the error is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            Self::Cloud { status, .. } => *status == Some(409),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
