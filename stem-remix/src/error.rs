//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The upload's extension or content cannot be decoded.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Model failure. Terminal for the job.
    #[error("Separation failed: {0}")]
    Separation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Self::Io(_) | Self::IoPath { .. } => "IO_FAILURE",
            Self::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            Self::Separation(_) => "SEPARATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_TRANSITION",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller can fix the problem by changing the request
    /// (re-upload, another device, different parameters).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::DeviceUnavailable(_)
                | Self::Validation(_)
                | Self::InvalidStateTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("Job", "abc");
        assert_eq!(err.kind(), "NOT_FOUND");
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::invalid_transition("SEPARATED", "LOADING");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot transition from SEPARATED to LOADING"
        );
        assert!(err.is_user_correctable());
    }

    #[test]
    fn test_user_correctable() {
        assert!(Error::DeviceUnavailable("gpu".into()).is_user_correctable());
        assert!(!Error::Separation("oom".into()).is_user_correctable());
        assert!(!Error::not_found("Job", "x").is_user_correctable());
    }

    #[test]
    fn test_io_path_kind() {
        let err = Error::io_path(
            "writing upload",
            Path::new("/tmp/x"),
            std::io::Error::other("disk full"),
        );
        assert_eq!(err.kind(), "IO_FAILURE");
        assert!(err.to_string().contains("/tmp/x"));
    }
}
