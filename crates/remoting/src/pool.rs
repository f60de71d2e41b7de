//! Bounded pool of remote sessions for one destination.
//!
//! # Accounting
//!
//! Every session the pool knows about is counted in `total` and is either idle
//! or in use. A slot reserved for a session that is still connecting counts as
//! in use, so `idle + in_use == total <= max_size` holds whenever the lock is
//! held. No network I/O ever happens under the lock.
//!
//! ```text
//!            acquire (idle available)
//!   ┌──────┐ ─────────────────────────→ ┌────────┐
//!   │ idle │                            │ in use │ ── release (unusable) ──→ destroyed
//!   └──────┘ ←───────── release ─────── └────────┘ ── discard ─────────────→ destroyed
//!      │                                    ↑
//!      │ maintainer: expired or ping fails  │ acquire / force_new (slot free):
//!      ↓                                    │ reserve, connect, init
//!   destroyed
//! ```
//!
//! # Background tasks
//!
//! A warmer grows the pool to `min(min_warm, max_size)` sessions, backing off
//! exponentially (with up to 50% jitter) while the host is unreachable. A
//! maintainer wakes every [`PoolConfig::maintenance_interval`], trims sessions idle longer than
//! `max_idle` while the pool is above its warm floor, pings the remaining idle
//! sessions and tops the pool back up. Both start on the first acquire (or at
//! construction with `eager_warm`) and stop on [`SessionPool::close`] or when
//! the last handle is dropped.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use parking_lot::Mutex;
use rand::Rng;
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::SessionAdapter,
    config::PoolConfig,
    error::{RemotingError, Result},
};

/// Produces unconnected sessions for a pool.
pub type SessionFactory = Arc<dyn Fn() -> SessionAdapter + Send + Sync>;

/// First delay after the warmer fails to connect.
pub const WARM_BACKOFF_INITIAL: Duration = Duration::from_millis(50);

/// Longest delay between warmer attempts.
pub const WARM_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Sessions owned by the pool, idle or in use.
    pub total: usize,
    /// Sessions handed out, including slots still connecting.
    pub in_use: usize,
    /// Sessions waiting in the idle set.
    pub idle: usize,
    /// Whether the pool was closed.
    pub closed: bool,
}

struct IdleSession {
    session: SessionAdapter,
    last_used: Instant,
}

struct PoolState {
    idle: VecDeque<IdleSession>,
    in_use: usize,
    total: usize,
    closed: bool,
}

struct Shared {
    name: String,
    config: PoolConfig,
    factory: SessionFactory,
    state: Mutex<PoolState>,
    notify: Notify,
    cancel: CancellationToken,
    background_started: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A slot counted in `total` and `in_use` whose session is not connected yet.
///
/// Dropping an unfinished reservation returns the slot, so a failed or
/// cancelled creation never leaks capacity.
struct Reservation<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self { shared, armed: true }
    }

    /// The caller keeps the session; the slot stays in use.
    fn hand_out(mut self) {
        self.armed = false;
    }

    /// Moves the new session to the idle set. Returns it back if the pool
    /// closed meanwhile so the caller can destroy it.
    fn park(mut self, session: SessionAdapter) -> Option<SessionAdapter> {
        self.armed = false;
        let rejected = {
            let mut state = self.shared.state.lock();
            state.in_use -= 1;
            if state.closed {
                state.total -= 1;
                Some(session)
            } else {
                state.idle.push_back(IdleSession { session, last_used: Instant::now() });
                None
            }
        };
        self.shared.notify.notify_one();
        rejected
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.shared.state.lock();
                state.total -= 1;
                state.in_use -= 1;
            }
            self.shared.notify.notify_one();
        }
    }
}

impl Shared {
    /// Reserves a slot if the pool holds fewer than `limit` sessions.
    fn try_reserve(&self, limit: usize) -> Result<Option<Reservation<'_>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RemotingError::PoolClosed);
        }
        if state.total < limit {
            state.total += 1;
            state.in_use += 1;
            return Ok(Some(Reservation::new(self)));
        }
        Ok(None)
    }

    async fn create_connected(&self) -> Result<SessionAdapter> {
        fail_point!("pool-before-connect", |_| {
            Err(RemotingError::connection("injected failure before connect"))
        });

        let mut session = (self.factory)();
        session.connect().await?;
        if let Err(err) = session.init().await {
            tracing::warn!(pool = %self.name, session_id = session.id(), error = %err, "Session init failed");
        }
        tracing::debug!(pool = %self.name, session_id = session.id(), "Session created");
        Ok(session)
    }

    /// Disconnects a session whose slot was already released.
    async fn destroy(&self, mut session: SessionAdapter, reason: &'static str) {
        if let Err(err) = session.disconnect().await {
            tracing::debug!(pool = %self.name, session_id = session.id(), error = %err, "Ignoring disconnect error");
        }
        tracing::debug!(pool = %self.name, session_id = session.id(), reason, "Session destroyed");
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats { total: state.total, in_use: state.in_use, idle: state.idle.len(), closed: state.closed }
    }

    fn warm_target(&self) -> usize {
        self.config.min_warm().min(self.config.max_size())
    }

    async fn maintain(&self) {
        let now = Instant::now();
        let floor = self.config.min_warm();

        let (expired, candidates) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let mut expired = Vec::new();
            let mut candidates = Vec::new();
            while let Some(idle) = state.idle.pop_front() {
                let too_old = self
                    .config
                    .max_idle()
                    .is_some_and(|max_idle| now.duration_since(idle.last_used) > max_idle);
                if too_old && state.total > floor {
                    state.total -= 1;
                    expired.push(idle.session);
                } else {
                    // Checked out for the ping.
                    state.in_use += 1;
                    candidates.push(idle);
                }
            }
            (expired, candidates)
        };

        let trimmed = expired.len();
        for session in expired {
            self.destroy(session, "idle timeout").await;
        }

        let mut unhealthy = 0;
        for IdleSession { mut session, last_used } in candidates {
            let healthy = session.ping().await;
            let rejected = {
                let mut state = self.state.lock();
                state.in_use -= 1;
                if healthy && !state.closed {
                    state.idle.push_back(IdleSession { session, last_used });
                    None
                } else {
                    state.total -= 1;
                    Some(session)
                }
            };
            self.notify.notify_one();
            if let Some(session) = rejected {
                if !healthy {
                    unhealthy += 1;
                }
                self.destroy(session, if healthy { "pool closed" } else { "ping failed" }).await;
            }
        }

        self.top_up().await;

        if trimmed > 0 || unhealthy > 0 {
            let stats = self.stats();
            tracing::debug!(
                pool = %self.name,
                trimmed,
                unhealthy,
                total = stats.total,
                in_use = stats.in_use,
                idle = stats.idle,
                "Maintainer sweep",
            );
        }
    }

    /// Creates sessions one at a time until the warm floor is reached.
    /// Returns `false` if a connect attempt failed.
    async fn top_up(&self) -> bool {
        loop {
            let reservation = match self.try_reserve(self.warm_target()) {
                Ok(Some(reservation)) => reservation,
                Ok(None) | Err(_) => return true,
            };
            match self.create_connected().await {
                Ok(session) => {
                    if let Some(session) = reservation.park(session) {
                        self.destroy(session, "pool closed").await;
                    }
                },
                Err(err) => {
                    tracing::warn!(pool = %self.name, error = %err, "Background connect failed");
                    return false;
                },
            }
        }
    }
}

async fn run_warmer(shared: Weak<Shared>, cancel: CancellationToken) {
    let mut backoff = WARM_BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let Some(pool) = shared.upgrade() else { return };
        if pool.top_up().await {
            tracing::debug!(pool = %pool.name, total = pool.stats().total, "Warm-up complete");
            return;
        }
        drop(pool);

        let jitter_range = u64::try_from(backoff.as_millis() / 2).unwrap_or(0);
        let delay = backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_range));
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {},
        }
        backoff = (backoff * 2).min(WARM_BACKOFF_MAX);
    }
}

async fn run_maintainer(shared: Weak<Shared>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {},
        }
        let Some(pool) = shared.upgrade() else { return };
        pool.maintain().await;
    }
}

/// Thread-safe pool of [`SessionAdapter`]s for one destination.
///
/// Cloning is cheap and clones share the same pool.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SessionPool {
    /// Creates a pool. With `eager_warm` the background tasks start right
    /// away when called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Config`] if `config` is invalid.
    pub fn new(name: impl Into<String>, config: PoolConfig, factory: SessionFactory) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                factory,
                state: Mutex::new(PoolState { idle: VecDeque::new(), in_use: 0, total: 0, closed: false }),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                background_started: AtomicBool::new(false),
            }),
        };
        if pool.shared.config.eager_warm() {
            pool.ensure_background();
        }
        Ok(pool)
    }

    /// Pool name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Borrows a session, waiting at most the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// See [`SessionPool::acquire_with_timeout`].
    pub async fn acquire(&self) -> Result<SessionAdapter> {
        self.acquire_with_timeout(self.shared.config.acquire_timeout()).await
    }

    /// Borrows a session.
    ///
    /// Idle sessions are handed out without a health check; the maintainer
    /// keeps them healthy. With no idle session and spare capacity a new one
    /// is connected for the caller; otherwise the call waits for a release.
    /// `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// - [`RemotingError::PoolClosed`] if the pool is or becomes closed
    /// - [`RemotingError::PoolTimeout`] if `timeout` elapses
    /// - the connect error if creating a new session failed
    #[tracing::instrument(skip(self), fields(pool = %self.shared.name))]
    pub async fn acquire_with_timeout(&self, timeout: Option<Duration>) -> Result<SessionAdapter> {
        self.ensure_background();
        let started = Instant::now();
        let deadline = timeout.map(|timeout| started + timeout);

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reservation = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(RemotingError::PoolClosed);
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.in_use += 1;
                    return Ok(idle.session);
                }
                if state.total < self.shared.config.max_size() {
                    state.total += 1;
                    state.in_use += 1;
                    Some(Reservation::new(&self.shared))
                } else {
                    None
                }
            };

            if let Some(reservation) = reservation {
                let session = self.shared.create_connected().await?;
                reservation.hand_out();
                return Ok(session);
            }

            self.wait(notified, started, deadline).await?;
        }
    }

    /// Creates a brand-new session for the caller, never reusing an idle one.
    ///
    /// When the pool is full the oldest idle session is evicted to make room;
    /// with nothing idle the call waits for a slot like `acquire`.
    ///
    /// # Errors
    ///
    /// Same as [`SessionPool::acquire`].
    #[tracing::instrument(skip(self), fields(pool = %self.shared.name))]
    pub async fn force_new(&self) -> Result<SessionAdapter> {
        self.ensure_background();
        let started = Instant::now();
        let deadline = self.shared.config.acquire_timeout().map(|timeout| started + timeout);

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let slot = {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(RemotingError::PoolClosed);
                }
                if state.total < self.shared.config.max_size() {
                    state.total += 1;
                    state.in_use += 1;
                    Some((Reservation::new(&self.shared), None))
                } else if let Some(oldest) = state.idle.pop_front() {
                    // The evicted session's slot passes to the new one.
                    state.in_use += 1;
                    Some((Reservation::new(&self.shared), Some(oldest.session)))
                } else {
                    None
                }
            };

            if let Some((reservation, evicted)) = slot {
                if let Some(evicted) = evicted {
                    self.shared.destroy(evicted, "evicted for fresh session").await;
                }
                let session = self.shared.create_connected().await?;
                reservation.hand_out();
                return Ok(session);
            }

            self.wait(notified, started, deadline).await?;
        }
    }

    /// Returns a borrowed session.
    ///
    /// The session goes back to the idle set unless the pool is closed or the
    /// transport reports itself unusable, in which case it is destroyed.
    pub async fn release(&self, session: SessionAdapter) {
        let rejected = {
            let mut state = self.shared.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if !state.closed && session.is_usable() {
                state.idle.push_back(IdleSession { session, last_used: Instant::now() });
                None
            } else {
                state.total = state.total.saturating_sub(1);
                Some((session, state.closed))
            }
        };
        self.shared.notify.notify_one();

        if let Some((session, closed)) = rejected {
            self.shared.destroy(session, if closed { "pool closed" } else { "unusable" }).await;
        }
    }

    /// Destroys a borrowed session instead of returning it.
    pub async fn discard(&self, session: SessionAdapter) {
        {
            let mut state = self.shared.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
        }
        self.shared.notify.notify_one();
        self.shared.destroy(session, "discarded").await;
    }

    /// Closes the pool: idle sessions are destroyed now, borrowed ones when
    /// released, and waiting acquirers fail with [`RemotingError::PoolClosed`].
    pub async fn close(&self) {
        let drained: Vec<IdleSession> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<IdleSession> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        self.shared.cancel.cancel();
        self.shared.notify.notify_waiters();

        tracing::debug!(pool = %self.shared.name, destroyed = drained.len(), "Pool closed");
        for idle in drained {
            self.shared.destroy(idle.session, "pool closed").await;
        }
    }

    async fn wait(
        &self,
        notified: std::pin::Pin<&mut tokio::sync::futures::Notified<'_>>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, notified)
                .await
                .map_err(|_| RemotingError::pool_timeout(started.elapsed())),
            None => {
                notified.await;
                Ok(())
            },
        }
    }

    fn ensure_background(&self) {
        if self.shared.background_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.shared.background_started.store(false, Ordering::Release);
            return;
        };

        let weak = Arc::downgrade(&self.shared);
        let cancel = self.shared.cancel.clone();
        if self.shared.warm_target() > 0 {
            runtime.spawn(run_warmer(weak.clone(), cancel.clone()));
        }
        runtime.spawn(run_maintainer(weak, cancel, self.shared.config.maintenance_interval()));
        tracing::debug!(pool = %self.shared.name, "Background tasks started");
    }
}
