//! Normalized outcome of a remote script invocation.

use std::borrow::Cow;

use bytes::Bytes;

use crate::error::{RemotingError, Result, SCRIPT_ERROR_STATUS};

/// Output of one script run, identical in shape for both transports.
///
/// `status_code` 0 means success. A runspace invocation that produced error
/// records reports status 1 with `had_errors` set; the command transport
/// reports the remote process exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteResult {
    /// Exit status of the script.
    pub status_code: i32,
    /// Raw standard output.
    pub std_out: Bytes,
    /// Raw standard error, or newline-joined error records.
    pub std_err: Bytes,
    /// Whether the runspace produced any error records.
    pub had_errors: bool,
}

impl RemoteResult {
    /// Creates a successful result carrying `std_out`.
    #[must_use]
    pub fn success(std_out: impl Into<Bytes>) -> Self {
        Self { status_code: 0, std_out: std_out.into(), std_err: Bytes::new(), had_errors: false }
    }

    /// Creates a result that reports script error records.
    #[must_use]
    pub fn with_errors(std_out: impl Into<Bytes>, std_err: impl Into<Bytes>) -> Self {
        Self {
            status_code: SCRIPT_ERROR_STATUS,
            std_out: std_out.into(),
            std_err: std_err.into(),
            had_errors: true,
        }
    }

    /// Whether the script succeeded without error records.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code == 0 && !self.had_errors
    }

    /// Standard output decoded as UTF-8, with invalid sequences replaced.
    #[must_use]
    pub fn stdout_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.std_out)
    }

    /// Standard error decoded as UTF-8, with invalid sequences replaced.
    #[must_use]
    pub fn stderr_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.std_err)
    }

    /// Converts error records or a non-zero status into an error.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::RemoteScriptExecution`] when the runspace
    /// reported error records and [`RemotingError::TransportExecution`] for
    /// any other non-zero status.
    pub fn check(self) -> Result<Self> {
        if self.had_errors {
            return Err(RemotingError::remote_script(self.stderr_text()));
        }
        if self.status_code != 0 {
            return Err(RemotingError::transport_execution(self.status_code, self.stderr_text()));
        }
        Ok(self)
    }
}
