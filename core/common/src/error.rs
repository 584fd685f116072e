//! Common error types for azkeep.

use thiserror::Error;

/// Top-level error type for azkeep operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Credentials or configuration missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A table or container could not be created or verified.
    ///
    /// `source` is the backend failure, carried unmodified.
    #[error("Provisioning of '{resource}' failed: {source}")]
    Provisioning {
        resource: String,
        #[source]
        source: Box<Error>,
    },

    /// The storage service answered with a failure status.
    #[error("Backend error ({status} {code}): {message}")]
    Backend {
        status: u16,
        code: String,
        message: String,
    },

    /// Transport failure before the service produced a response.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Build a backend error from a status and service error code.
    pub fn backend(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this failure came from the storage service or the wire to it.
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend { .. } | Error::Network(_))
    }

    /// HTTP status reported by the service, if any.
    ///
    /// Provisioning failures report the status of the wrapped error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Backend { status, .. } => Some(*status),
            Error::Provisioning { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Service error code (e.g. `EntityAlreadyExists`), if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Backend { code, .. } => Some(code),
            Error::Provisioning { source, .. } => source.code(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_exposes_wrapped_status() {
        let err = Error::Provisioning {
            resource: "builds".to_string(),
            source: Box::new(Error::backend(403, "AuthorizationFailure", "denied")),
        };

        assert_eq!(err.status(), Some(403));
        assert_eq!(err.code(), Some("AuthorizationFailure"));
        assert!(!err.is_backend());
    }

    #[test]
    fn test_network_counts_as_backend() {
        assert!(Error::Network("reset".to_string()).is_backend());
        assert!(!Error::Configuration("missing".to_string()).is_backend());
    }
}
