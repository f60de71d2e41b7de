//! Transport-independent session abstraction.

use std::fmt;

use async_trait::async_trait;

use crate::{
    config::TransportConfig,
    credentials::RemoteTarget,
    encoding::exceeds_encoded_limit,
    error::Result,
    result::RemoteResult,
    runspace::RunspaceSession,
    winrm::WinRmSession,
};

/// A live connection able to run PowerShell scripts on a remote host.
///
/// Implementations are driven by one owner at a time; the pool hands a
/// session out exclusively between `acquire` and `release`.
#[async_trait]
pub trait RemoteSession: Send + Sync + fmt::Debug {
    /// Opens the connection.
    async fn connect(&mut self) -> Result<()>;

    /// Closes the connection. Closing an unconnected session is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    /// Runs one script and returns its normalized result.
    async fn run_script(&mut self, script: &str) -> Result<RemoteResult>;

    /// Whether the session can still serve scripts without a network check.
    ///
    /// A session whose transport broke mid-call returns `false` so the pool
    /// destroys it instead of returning it to the idle set.
    fn is_usable(&self) -> bool {
        true
    }
}

/// Which transport a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// One-shot `powershell -encodedcommand` per script.
    WinRm,
    /// Persistent PowerShell host with structured error records.
    Psrp,
}

impl Protocol {
    /// Picks the transport able to carry `script`.
    ///
    /// Scripts whose encoded command exceeds the command-line ceiling go to
    /// the runspace transport, which has no such limit.
    #[must_use]
    pub fn for_script(script: &str) -> Self {
        if exceeds_encoded_limit(script) { Self::Psrp } else { Self::WinRm }
    }

    /// Short name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WinRm => "winrm",
            Self::Psrp => "psrp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates unconnected sessions for a target.
///
/// The pool manager and the non-pooled dispatcher path share one connector,
/// which is also the seam for substituting test doubles.
pub trait SessionConnector: Send + Sync + fmt::Debug {
    /// Builds an unconnected session speaking `protocol` to `target`.
    fn create(&self, protocol: Protocol, target: &RemoteTarget) -> Box<dyn RemoteSession>;
}

/// Connector producing the WS-Management backed sessions.
#[derive(Debug, Clone, Default)]
pub struct WsManConnector {
    transport: TransportConfig,
}

impl WsManConnector {
    /// Creates a connector using `transport` settings for every session.
    #[must_use]
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }
}

impl SessionConnector for WsManConnector {
    fn create(&self, protocol: Protocol, target: &RemoteTarget) -> Box<dyn RemoteSession> {
        match protocol {
            Protocol::WinRm => Box::new(WinRmSession::new(target.clone(), self.transport.clone())),
            Protocol::Psrp => Box::new(RunspaceSession::new(target.clone(), self.transport.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_script_uses_winrm() {
        assert_eq!(Protocol::for_script(&"a".repeat(100)), Protocol::WinRm);
    }

    #[test]
    fn test_long_script_uses_psrp() {
        assert_eq!(Protocol::for_script(&"a".repeat(4000)), Protocol::Psrp);
    }

    #[test]
    fn test_display() {
        assert_eq!(Protocol::WinRm.to_string(), "winrm");
        assert_eq!(Protocol::Psrp.to_string(), "psrp");
    }
}
