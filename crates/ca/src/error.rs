//! CA operation error types.
//!
//! The variants keep the conditions a caller must tell apart distinct all
//! the way up:
//!
//! - [`CaError::NotFound`] - the CA has no matching certificate
//! - [`CaError::Validation`] - caller input or CA output failed a precondition
//! - [`CaError::Remoting`] - the CA host could not be reached or the script failed
//! - [`CaError::Encoding`] - the enrollment request could not be encoded
//! - [`CaError::Certificate`] - a caller-supplied certificate could not be decoded
//! - [`CaError::Config`] - invalid service configuration

use std::sync::Arc;

use adcs_connector_cmc::CmcError;
use adcs_connector_remoting::{ConfigError, RemotingError};
use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for CA operations.
pub type Result<T> = std::result::Result<T, CaError>;

/// Errors produced by CA operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CaError {
    /// The requested object does not exist on the CA.
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// A precondition on input or output failed.
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the failed precondition.
        message: String,
    },

    /// Remote execution failed.
    #[error(transparent)]
    Remoting(#[from] RemotingError),

    /// CMC request encoding failed.
    #[error(transparent)]
    Encoding(#[from] CmcError),

    /// A certificate could not be decoded.
    #[error("Invalid certificate: {message}")]
    Certificate {
        /// Description of the decoding failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CaError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new `Certificate` error.
    #[must_use]
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate { message: message.into(), source: None }
    }

    /// Creates a new `Certificate` error with a source.
    #[must_use]
    pub fn certificate_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Certificate { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Whether the error means the object is absent rather than unreachable.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_remoting_error_is_transparent() {
        let err = CaError::from(RemotingError::transport_execution(1, "access denied"));
        assert_eq!(err.to_string(), "Remote command failed with status 1: access denied");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_certificate_error_keeps_source() {
        let source = std::io::Error::other("truncated");
        let err = CaError::certificate_with_source("bad DER", source);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("bad DER"));
    }

    #[test]
    fn test_not_found() {
        assert!(CaError::not_found("Certificate not found").is_not_found());
    }
}
