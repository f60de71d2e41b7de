//! Error types for CMC request encoding.
//!
//! Every failure that can occur while turning a caller-supplied CRMF request
//! into a CMS-wrapped CMC request maps to one [`CmcError`] variant:
//!
//! - [`CmcError::Base64`] - the request is not valid base64
//! - [`CmcError::Der`] - DER decoding or encoding failed
//! - [`CmcError::EmptyRequest`] - the CRMF message sequence holds no request
//! - [`CmcError::MissingField`] - the certificate template lacks a required field
//! - [`CmcError::InvalidTemplateVersion`] - the template version is not `major.minor`
//! - [`CmcError::InvalidOid`] - the template OID is not dotted-decimal

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for CMC encoding operations.
pub type Result<T> = std::result::Result<T, CmcError>;

/// Errors produced while decoding CRMF input or encoding the CMC envelope.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CmcError {
    /// The request payload is not valid base64.
    #[error("Invalid base64 request: {message}")]
    Base64 {
        /// Description of the decoding failure.
        message: String,
        /// The underlying decoder error.
        #[source]
        source: Option<BoxError>,
    },

    /// DER decoding or encoding failed.
    #[error("DER error while processing {context}: {source}")]
    Der {
        /// Which structure was being processed.
        context: &'static str,
        /// The underlying DER error.
        #[source]
        source: der::Error,
    },

    /// The CRMF message sequence did not contain any request.
    #[error("CRMF request contains no certificate request messages")]
    EmptyRequest,

    /// A field required to build the certification request is absent.
    #[error("CRMF certificate template is missing the {field} field")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// The template version could not be split into numeric major/minor parts.
    #[error("Invalid template version '{version}': expected 'major.minor'")]
    InvalidTemplateVersion {
        /// The offending version string.
        version: String,
    },

    /// The template OID is not a valid dotted-decimal object identifier.
    #[error("Invalid template OID '{oid}'")]
    InvalidOid {
        /// The offending OID string.
        oid: String,
    },
}

impl CmcError {
    /// Creates a new `Base64` error with a source.
    #[must_use]
    pub fn base64(source: base64::DecodeError) -> Self {
        Self::Base64 { message: source.to_string(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Der` error for the given structure.
    #[must_use]
    pub fn der(context: &'static str, source: der::Error) -> Self {
        Self::Der { context, source }
    }

    /// Creates a new `MissingField` error.
    #[must_use]
    pub fn missing_field(field: &'static str) -> Self {
        Self::MissingField { field }
    }

    /// Creates a new `InvalidTemplateVersion` error.
    #[must_use]
    pub fn invalid_template_version(version: impl Into<String>) -> Self {
        Self::InvalidTemplateVersion { version: version.into() }
    }

    /// Creates a new `InvalidOid` error.
    #[must_use]
    pub fn invalid_oid(oid: impl Into<String>) -> Self {
        Self::InvalidOid { oid: oid.into() }
    }
}

/// Extension trait attaching structure context to `der` results.
pub(crate) trait DerContext<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> DerContext<T> for der::Result<T> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| CmcError::der(context, source))
    }
}
