//! In-memory sessions for exercising pools and the dispatcher without a
//! Windows host.
//!
//! A [`MockBehavior`] is shared by every session a factory or connector
//! produces, so tests can inject failures and read counters across the whole
//! session population.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    adapter::{PING_SCRIPT, SHARED_INIT_SCRIPT, SessionAdapter},
    credentials::{AuthScheme, Credentials, RemoteTarget},
    error::{RemotingError, Result},
    key::SessionKey,
    pool::SessionFactory,
    result::RemoteResult,
    session::{Protocol, RemoteSession, SessionConnector},
};

/// Shared knobs and counters for mock sessions.
#[derive(Debug, Default)]
pub struct MockBehavior {
    connect_failures: AtomicUsize,
    run_failures: AtomicUsize,
    unhealthy: AtomicBool,
    connect_delay_ms: AtomicU64,
    responses: Mutex<VecDeque<Result<RemoteResult>>>,
    scripts: Mutex<Vec<String>>,
    sessions_created: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    runs: AtomicUsize,
    pings: AtomicUsize,
    inits: AtomicUsize,
}

impl MockBehavior {
    /// Creates a behavior where everything succeeds.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` connect attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` non-ping scripts fail with a transport failure and break
    /// their session.
    pub fn fail_next_runs(&self, n: usize) {
        self.run_failures.store(n, Ordering::SeqCst);
    }

    /// Makes keep-alive pings report an unhealthy session.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Delays every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Queues the outcome of the next non-ping script.
    pub fn push_response(&self, response: Result<RemoteResult>) {
        self.responses.lock().push_back(response);
    }

    /// Every non-ping, non-init script run so far, in order.
    #[must_use]
    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().clone()
    }

    /// Sessions constructed.
    #[must_use]
    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    /// Connect attempts, including failed ones.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Disconnects of connected sessions.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Scripts run, excluding pings and init.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Keep-alive pings.
    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Shell initializations.
    #[must_use]
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

/// A session backed by a [`MockBehavior`].
#[derive(Debug)]
pub struct MockSession {
    behavior: Arc<MockBehavior>,
    connected: bool,
    broken: bool,
}

impl MockSession {
    /// Creates an unconnected session and counts it.
    #[must_use]
    pub fn new(behavior: Arc<MockBehavior>) -> Self {
        behavior.sessions_created.fetch_add(1, Ordering::SeqCst);
        Self { behavior, connected: false, broken: false }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn connect(&mut self) -> Result<()> {
        self.behavior.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.behavior.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if MockBehavior::take_failure(&self.behavior.connect_failures) {
            return Err(RemotingError::connection("mock host unreachable"));
        }
        self.connected = true;
        self.broken = false;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if std::mem::take(&mut self.connected) {
            self.behavior.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn run_script(&mut self, script: &str) -> Result<RemoteResult> {
        if !self.connected {
            return Err(RemotingError::connection("mock session is not connected"));
        }

        if script == PING_SCRIPT {
            self.behavior.pings.fetch_add(1, Ordering::SeqCst);
            if self.behavior.unhealthy.load(Ordering::SeqCst) {
                return Ok(RemoteResult { status_code: 1, ..Default::default() });
            }
            return Ok(RemoteResult::success(""));
        }

        if script == SHARED_INIT_SCRIPT {
            self.behavior.inits.fetch_add(1, Ordering::SeqCst);
            return Ok(RemoteResult::success(""));
        }

        self.behavior.runs.fetch_add(1, Ordering::SeqCst);
        self.behavior.scripts.lock().push(script.to_owned());
        if MockBehavior::take_failure(&self.behavior.run_failures) {
            self.broken = true;
            return Err(RemotingError::transport_failure("mock connection reset"));
        }
        self.behavior.responses.lock().pop_front().unwrap_or_else(|| Ok(RemoteResult::success("")))
    }

    fn is_usable(&self) -> bool {
        !self.broken
    }
}

/// Connector producing [`MockSession`]s and recording requested protocols.
#[derive(Debug)]
pub struct MockConnector {
    behavior: Arc<MockBehavior>,
    protocols: Mutex<Vec<Protocol>>,
}

impl MockConnector {
    /// Creates a connector sharing `behavior`.
    #[must_use]
    pub fn new(behavior: &Arc<MockBehavior>) -> Arc<Self> {
        Arc::new(Self { behavior: Arc::clone(behavior), protocols: Mutex::new(Vec::new()) })
    }

    /// Protocols of every session created so far.
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        self.protocols.lock().clone()
    }
}

impl SessionConnector for MockConnector {
    fn create(&self, protocol: Protocol, _target: &RemoteTarget) -> Box<dyn RemoteSession> {
        self.protocols.lock().push(protocol);
        Box::new(MockSession::new(Arc::clone(&self.behavior)))
    }
}

/// A target that only mock connectors can reach.
#[must_use]
pub fn mock_target() -> RemoteTarget {
    RemoteTarget::new("ca01.test.local", 5985, false, Credentials::new("svc-adcs", "secret", AuthScheme::Basic))
}

/// Session factory for pools under test.
#[must_use]
pub fn mock_factory(behavior: &Arc<MockBehavior>) -> SessionFactory {
    let behavior = Arc::clone(behavior);
    let key = Arc::new(SessionKey::new(Protocol::WinRm, &mock_target()));
    Arc::new(move || SessionAdapter::new(Box::new(MockSession::new(Arc::clone(&behavior))), Arc::clone(&key)))
}
