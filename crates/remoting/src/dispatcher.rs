//! Script dispatch: protocol selection, pooled execution and the single
//! retry on a fresh session.

use std::sync::Arc;

use async_trait::async_trait;
use fail::fail_point;

use crate::{
    config::RemotingConfig,
    credentials::RemoteTarget,
    error::{RemotingError, Result},
    manager::PoolManager,
    result::RemoteResult,
    session::{Protocol, SessionConnector, WsManConnector},
};

/// Runs PowerShell scripts against a CA host.
///
/// This is the seam the CA operations depend on, so they can be exercised
/// without a Windows host.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Runs `script` on `target` and returns its result.
    async fn invoke(&self, target: &RemoteTarget, script: &str) -> Result<RemoteResult>;
}

/// Default [`ScriptExecutor`].
///
/// With pooling enabled each script borrows a session from the pool for its
/// destination and protocol. If the borrow or the run fails, the session is
/// discarded and the script runs exactly once more on a freshly created
/// session; the second outcome is returned as is. With pooling disabled every
/// script opens, uses and closes its own session.
#[derive(Debug)]
pub struct RemotingDispatcher {
    manager: Option<Arc<PoolManager>>,
    connector: Arc<dyn SessionConnector>,
}

impl RemotingDispatcher {
    /// Creates a dispatcher speaking WS-Management.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Config`] if `config` is invalid.
    pub fn new(config: RemotingConfig) -> Result<Self> {
        let connector = Arc::new(WsManConnector::new(config.transport.clone()));
        Self::with_connector(config, connector)
    }

    /// Creates a dispatcher using `connector` for every session.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Config`] if `config` is invalid.
    pub fn with_connector(config: RemotingConfig, connector: Arc<dyn SessionConnector>) -> Result<Self> {
        config.validate()?;
        let manager = if config.pool_enabled {
            Some(Arc::new(PoolManager::new(config.pool, Arc::clone(&connector))?))
        } else {
            None
        };
        Ok(Self { manager, connector })
    }

    /// Creates a pooled dispatcher around an existing manager.
    #[must_use]
    pub fn with_manager(manager: Arc<PoolManager>, connector: Arc<dyn SessionConnector>) -> Self {
        Self { manager: Some(manager), connector }
    }

    /// The pool manager, when pooling is enabled.
    #[must_use]
    pub fn manager(&self) -> Option<&Arc<PoolManager>> {
        self.manager.as_ref()
    }

    /// Closes every pool. A no-op when pooling is disabled.
    pub async fn shutdown(&self) {
        if let Some(manager) = &self.manager {
            manager.close_all().await;
        }
    }

    async fn invoke_pooled(
        &self,
        manager: &PoolManager,
        target: &RemoteTarget,
        protocol: Protocol,
        script: &str,
    ) -> Result<RemoteResult> {
        let pool = manager.get_pool(target, protocol)?;

        let first = match pool.acquire().await {
            Ok(mut session) => match session.run_script(script).await {
                Ok(result) => {
                    pool.release(session).await;
                    return Ok(result);
                },
                Err(err) => {
                    pool.discard(session).await;
                    err
                },
            },
            Err(err) => err,
        };

        if matches!(first, RemotingError::PoolClosed) {
            return Err(first);
        }
        tracing::warn!(
            pool = pool.name(),
            error = %first,
            "Session likely unhealthy; retrying once with a new session",
        );

        fail_point!("dispatch-before-retry", |_| {
            Err(RemotingError::transport_failure("injected failure before retry"))
        });

        let mut session = pool.force_new().await?;
        let result = session.run_script(script).await;
        pool.release(session).await;
        result
    }

    async fn invoke_direct(&self, target: &RemoteTarget, protocol: Protocol, script: &str) -> Result<RemoteResult> {
        let mut session = self.connector.create(protocol, target);
        session.connect().await?;
        let result = session.run_script(script).await;
        if let Err(err) = session.disconnect().await {
            tracing::debug!(host = %target.host, error = %err, "Ignoring disconnect error");
        }
        result
    }
}

#[async_trait]
impl ScriptExecutor for RemotingDispatcher {
    #[tracing::instrument(
        skip(self, target, script),
        fields(host = %target.host, port = target.port, script_len = script.len(), protocol = tracing::field::Empty)
    )]
    async fn invoke(&self, target: &RemoteTarget, script: &str) -> Result<RemoteResult> {
        let protocol = Protocol::for_script(script);
        tracing::Span::current().record("protocol", protocol.as_str());

        match &self.manager {
            Some(manager) => self.invoke_pooled(manager, target, protocol, script).await,
            None => self.invoke_direct(target, protocol, script).await,
        }
    }
}
