//! Pooled PowerShell remoting to Windows Certificate Authority hosts.
//!
//! Scripts are dispatched over WS-Management either as one-shot
//! `powershell -encodedcommand` invocations or, when the encoded command
//! would exceed the command-line ceiling, through a persistent PowerShell
//! host that reports structured error records. Sessions are pooled per
//! destination so repeated CA operations reuse an authenticated shell.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ RemotingDispatcher (ScriptExecutor)                          │
//! │   Protocol::for_script → get_pool → acquire → run → release  │
//! │   on failure: discard → force_new → run once more            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ PoolManager          one SessionPool per SessionKey          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ SessionPool          idle set │ warmer │ maintainer          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ SessionAdapter       init │ ping │ per-protocol health       │
//! ├──────────────────────────────────────────────────────────────┤
//! │ RemoteSession        WinRmSession │ RunspaceSession          │
//! ├──────────────────────────────────────────────────────────────┤
//! │ WS-Management over HTTP(S)                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocols
//!
//! | Protocol | Session             | Script failure surfaces as                  |
//! | -------- | ------------------- | ------------------------------------------- |
//! | `winrm`  | [`WinRmSession`]    | [`RemotingError::TransportExecution`]       |
//! | `psrp`   | [`RunspaceSession`] | [`RemoteResult::had_errors`] (status `1`)   |
//!
//! # Example
//!
//! ```no_run
//! use adcs_connector_remoting::{
//!     AuthScheme, Credentials, RemoteTarget, RemotingConfig, RemotingDispatcher, ScriptExecutor,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = RemotingDispatcher::new(RemotingConfig::default())?;
//! let target = RemoteTarget::new("ca01.corp.local", 5985, false, Credentials::new("svc", "pw", AuthScheme::Basic));
//!
//! let result = dispatcher.invoke(&target, "Get-Date").await?;
//! println!("{}", result.stdout_text());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
/// Pool and transport configuration.
pub mod config;
mod credentials;
mod dispatcher;
/// PowerShell command encoding helpers.
pub mod encoding;
mod encryption;
mod error;
mod key;
#[cfg(test)]
mod loopback;
mod manager;
mod ntlm;
mod pool;
mod result;
mod runspace;
mod session;
mod winrm;
mod wsman;

/// Mock sessions and connectors for tests.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

/// Session wrapper handled by pools.
pub use adapter::{PING_SCRIPT, SHARED_INIT_SCRIPT, SessionAdapter};
/// Configuration types.
pub use config::{PoolConfig, RemotingConfig, TransportConfig};
/// Targets and credentials.
pub use credentials::{
    AuthScheme, CredentialRef, Credentials, DEFAULT_HTTP_PORT, DEFAULT_HTTPS_PORT, RemoteTarget, SecretValue,
};
/// Script dispatch.
pub use dispatcher::{RemotingDispatcher, ScriptExecutor};
/// Error types.
pub use error::{BoxError, ConfigError, RemotingError, Result, SCRIPT_ERROR_STATUS, TRANSPORT_FAILURE_STATUS};
/// Pool identity.
pub use key::SessionKey;
/// Pool registry.
pub use manager::PoolManager;
/// Session pool.
pub use pool::{PoolStats, SessionFactory, SessionPool};
/// Normalized script result.
pub use result::RemoteResult;
/// Runspace transport.
pub use runspace::{ErrorRecord, RunspaceSession};
/// Session abstraction.
pub use session::{Protocol, RemoteSession, SessionConnector, WsManConnector};
/// Command transport.
pub use winrm::WinRmSession;
