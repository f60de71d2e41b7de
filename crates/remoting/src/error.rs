//! Remoting error types and result alias.
//!
//! The taxonomy separates a script that *ran and reported failure* from a
//! transport that *could not run it*:
//!
//! - [`RemotingError::TransportExecution`] - WinRM command exited non-zero
//! - [`RemotingError::RemoteScriptExecution`] - runspace emitted error records
//! - [`RemotingError::TransportFailure`] - the connection or protocol broke mid-call
//! - [`RemotingError::Connection`] - a session could not be opened
//! - [`RemotingError::PoolClosed`] / [`RemotingError::PoolTimeout`] - pool conditions
//! - [`RemotingError::UnsupportedAuth`] - the configured auth scheme is unavailable
//! - [`RemotingError::Config`] - invalid pool or transport configuration

use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for remoting operations.
pub type Result<T> = std::result::Result<T, RemotingError>;

/// Status code reported when the transport itself failed.
pub const TRANSPORT_FAILURE_STATUS: i32 = -1;

/// Status code reported when a runspace invocation produced error records.
pub const SCRIPT_ERROR_STATUS: i32 = 1;

/// Errors produced by remote sessions, pools and the dispatcher.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RemotingError {
    /// A WinRM command finished with a non-zero exit status.
    #[error("Remote command failed with status {status_code}: {stderr}")]
    TransportExecution {
        /// Remote exit status.
        status_code: i32,
        /// Decoded standard error of the command.
        stderr: String,
    },

    /// A runspace invocation completed but reported error records.
    #[error("Remote script reported errors (status {status_code}): {message}")]
    RemoteScriptExecution {
        /// Always [`SCRIPT_ERROR_STATUS`].
        status_code: i32,
        /// Error record messages joined with newlines.
        message: String,
    },

    /// The transport broke while a script was running.
    #[error("Transport failure: {message}")]
    TransportFailure {
        /// Description of the failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// A session could not be opened.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
        /// The underlying error.
        #[source]
        source: Option<BoxError>,
    },

    /// The session pool was closed.
    #[error("Session pool is closed")]
    PoolClosed,

    /// No session became available before the acquire timeout elapsed.
    #[error("Timed out after {waited:?} acquiring a session from the pool")]
    PoolTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The configured authentication scheme is not supported by this transport.
    #[error("Authentication scheme '{scheme}' is not supported")]
    UnsupportedAuth {
        /// The requested scheme.
        scheme: String,
    },

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RemotingError {
    /// Creates a new `TransportExecution` error.
    #[must_use]
    pub fn transport_execution(status_code: i32, stderr: impl Into<String>) -> Self {
        Self::TransportExecution { status_code, stderr: stderr.into() }
    }

    /// Creates a new `RemoteScriptExecution` error.
    #[must_use]
    pub fn remote_script(message: impl Into<String>) -> Self {
        Self::RemoteScriptExecution { status_code: SCRIPT_ERROR_STATUS, message: message.into() }
    }

    /// Creates a new `TransportFailure` error.
    #[must_use]
    pub fn transport_failure(message: impl Into<String>) -> Self {
        Self::TransportFailure { message: message.into(), source: None }
    }

    /// Creates a new `TransportFailure` error with a source.
    #[must_use]
    pub fn transport_failure_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransportFailure { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a source.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `PoolTimeout` error.
    #[must_use]
    pub fn pool_timeout(waited: Duration) -> Self {
        Self::PoolTimeout { waited }
    }

    /// Creates a new `UnsupportedAuth` error.
    #[must_use]
    pub fn unsupported_auth(scheme: impl Into<String>) -> Self {
        Self::UnsupportedAuth { scheme: scheme.into() }
    }

    /// The remote status code carried by this error, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::TransportExecution { status_code, .. }
            | Self::RemoteScriptExecution { status_code, .. } => Some(*status_code),
            Self::TransportFailure { .. } => Some(TRANSPORT_FAILURE_STATUS),
            _ => None,
        }
    }

    /// Whether the error originates from the transport rather than from the
    /// script or the pool.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure { .. } | Self::Connection { .. })
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Field name.
        field: &'static str,
        /// Minimum allowed value.
        min: String,
        /// Offending value.
        value: String,
    },

    /// A value is above its allowed maximum.
    #[error("{field} must be at most {max}, got {value}")]
    AboveMaximum {
        /// Field name.
        field: &'static str,
        /// Maximum allowed value.
        max: String,
        /// Offending value.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A value is malformed.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
