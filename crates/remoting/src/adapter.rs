//! Uniform wrapper the pool manages instead of raw sessions.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    error::Result,
    key::SessionKey,
    result::RemoteResult,
    session::{Protocol, RemoteSession},
};

/// Script run once on every freshly connected pooled session.
pub const SHARED_INIT_SCRIPT: &str = "$ProgressPreference = 'SilentlyContinue'\n\
$PSDefaultParameterValues['Out-File:Encoding'] = 'utf8'\n";

/// No-op script used as keep-alive.
pub const PING_SCRIPT: &str = "$null=1";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A session plus the pool key it belongs to.
///
/// Health is judged per protocol: the command transport is healthy when the
/// ping exits 0, the runspace transport additionally requires that no error
/// records were produced.
pub struct SessionAdapter {
    inner: Box<dyn RemoteSession>,
    key: Arc<SessionKey>,
    id: u64,
}

impl SessionAdapter {
    /// Wraps an unconnected session.
    #[must_use]
    pub fn new(inner: Box<dyn RemoteSession>, key: Arc<SessionKey>) -> Self {
        Self { inner, key, id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed) }
    }

    /// Pool key of this session.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Transport protocol.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.key.protocol
    }

    /// Process-unique id, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// Propagates the transport's connect error.
    pub async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await
    }

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Propagates the transport's disconnect error.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.inner.disconnect().await
    }

    /// Runs a script.
    ///
    /// # Errors
    ///
    /// Propagates the transport's execution error.
    pub async fn run_script(&mut self, script: &str) -> Result<RemoteResult> {
        self.inner.run_script(script).await
    }

    /// Runs the one-time shell initialization.
    ///
    /// # Errors
    ///
    /// Propagates the transport's execution error.
    pub async fn init(&mut self) -> Result<()> {
        self.inner.run_script(SHARED_INIT_SCRIPT).await.map(|_| ())
    }

    /// Cheap liveness check. Any error counts as unhealthy.
    pub async fn ping(&mut self) -> bool {
        tracing::debug!(key = %self.key, session_id = self.id, "Pinging session");
        match self.inner.run_script(PING_SCRIPT).await {
            Ok(result) => match self.key.protocol {
                Protocol::WinRm => result.status_code == 0,
                Protocol::Psrp => result.status_code == 0 && !result.had_errors,
            },
            Err(err) => {
                tracing::debug!(key = %self.key, session_id = self.id, error = %err, "Keep-alive ping failed");
                false
            },
        }
    }

    /// Whether the transport still considers itself usable.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }
}

impl fmt::Debug for SessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAdapter")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("inner", &self.inner)
            .finish()
    }
}
