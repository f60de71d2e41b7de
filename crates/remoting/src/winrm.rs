//! Command transport: one `powershell -encodedcommand` per script.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    config::TransportConfig,
    credentials::RemoteTarget,
    encoding::{bootstrap, encode_command},
    error::{RemotingError, Result},
    result::RemoteResult,
    session::RemoteSession,
    wsman::WsManClient,
};

/// Stateless session over a WS-Management cmd shell.
///
/// Every script runs in a fresh PowerShell process, so nothing survives
/// between invocations except the shell itself.
#[derive(Debug)]
pub struct WinRmSession {
    target: RemoteTarget,
    transport: TransportConfig,
    client: Option<WsManClient>,
    shell_id: Option<String>,
    broken: bool,
}

impl WinRmSession {
    /// Creates an unconnected session.
    #[must_use]
    pub fn new(target: RemoteTarget, transport: TransportConfig) -> Self {
        Self { target, transport, client: None, shell_id: None, broken: false }
    }

    /// Runs a script of any length by shipping it compressed inside the
    /// decompress-and-evaluate bootstrap.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteSession::run_script`].
    pub async fn run_long_script(&mut self, script: &str) -> Result<RemoteResult> {
        let wrapped = bootstrap(script)
            .map_err(|e| RemotingError::transport_failure_with_source("failed to compress script", e))?;
        self.run_script(&wrapped).await
    }

    fn connected(&self) -> Result<(&WsManClient, &str)> {
        match (&self.client, &self.shell_id) {
            (Some(client), Some(shell_id)) => Ok((client, shell_id)),
            _ => Err(RemotingError::connection(format!("session to {} is not connected", self.target.host))),
        }
    }
}

#[async_trait]
impl RemoteSession for WinRmSession {
    async fn connect(&mut self) -> Result<()> {
        let client = WsManClient::new(&self.target, &self.transport)?;
        let shell_id = client.create_shell().await.map_err(|e| match e {
            RemotingError::Connection { .. } => e,
            other => RemotingError::connection_with_source(
                format!("failed to open shell on {}", client.endpoint()),
                other,
            ),
        })?;

        tracing::debug!(host = %self.target.host, shell_id = %shell_id, "Opened WinRM shell");
        self.client = Some(client);
        self.shell_id = Some(shell_id);
        self.broken = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let (Some(client), Some(shell_id)) = (self.client.take(), self.shell_id.take()) else {
            return Ok(());
        };
        client.delete_shell(&shell_id).await?;
        tracing::debug!(host = %self.target.host, shell_id = %shell_id, "Closed WinRM shell");
        Ok(())
    }

    #[tracing::instrument(skip(self, script), fields(host = %self.target.host, script_len = script.len()))]
    async fn run_script(&mut self, script: &str) -> Result<RemoteResult> {
        tracing::trace!(script, "Running PowerShell script");
        let command = format!("powershell -encodedcommand {}", encode_command(script));

        let output = {
            let (client, shell_id) = self.connected()?;
            let run = async {
                let command_id = client.command(shell_id, &command, &[], true).await?;
                let output = client.receive_all(shell_id, &command_id).await;
                client.signal_terminate(shell_id, &command_id).await;
                output
            };
            run.await
        };
        let output = output.inspect_err(|_| self.broken = true)?;

        let result = RemoteResult {
            status_code: output.exit_code.unwrap_or(0),
            std_out: Bytes::from(output.stdout),
            std_err: Bytes::from(output.stderr),
            had_errors: false,
        };
        tracing::debug!(status_code = result.status_code, "Command finished");

        if result.status_code != 0 {
            return Err(RemotingError::transport_execution(result.status_code, result.stderr_text()));
        }
        Ok(result)
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::credentials::{AuthScheme, Credentials};

    fn target(scheme: AuthScheme) -> RemoteTarget {
        RemoteTarget::new("127.0.0.1", 1, false, Credentials::new("svc", "pw", scheme))
    }

    #[tokio::test]
    async fn test_run_before_connect_fails() {
        let mut session = WinRmSession::new(target(AuthScheme::Basic), TransportConfig::default());
        let err = session.run_script("$null=1").await.unwrap_err();
        assert!(matches!(err, RemotingError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_unsupported_scheme() {
        let mut session = WinRmSession::new(target(AuthScheme::CredSsp), TransportConfig::default());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, RemotingError::UnsupportedAuth { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_unconnected_is_noop() {
        let mut session = WinRmSession::new(target(AuthScheme::Basic), TransportConfig::default());
        session.disconnect().await.unwrap();
        assert!(session.is_usable());
    }
}
