//! Registry of session pools keyed by destination.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    adapter::SessionAdapter,
    config::PoolConfig,
    credentials::RemoteTarget,
    error::Result,
    key::SessionKey,
    pool::{PoolStats, SessionFactory, SessionPool},
    session::{Protocol, SessionConnector},
};

/// Hands out one [`SessionPool`] per [`SessionKey`].
///
/// Pools are created lazily on first use and live until
/// [`PoolManager::close_all`]. Every pool shares the manager's
/// [`PoolConfig`] and [`SessionConnector`].
pub struct PoolManager {
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    pools: Mutex<HashMap<SessionKey, SessionPool>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .field("pools", &self.pools.lock().len())
            .finish()
    }
}

impl PoolManager {
    /// Creates an empty manager.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Config`](crate::RemotingError::Config) if
    /// `config` is invalid.
    pub fn new(config: PoolConfig, connector: Arc<dyn SessionConnector>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, connector, pools: Mutex::new(HashMap::new()) })
    }

    /// Returns the pool for `target` over `protocol`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Config`](crate::RemotingError::Config) if the
    /// pool could not be constructed.
    #[tracing::instrument(skip(self, target), fields(host = %target.host, protocol = %protocol))]
    pub fn get_pool(&self, target: &RemoteTarget, protocol: Protocol) -> Result<SessionPool> {
        let key = SessionKey::new(protocol, target);

        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        let name = format!("{protocol}://{}:{}", target.host, target.port);
        let factory = self.factory(key.clone(), target.clone());
        let pool = SessionPool::new(name, self.config.clone(), factory)?;
        tracing::debug!(key = %key, max_size = self.config.max_size(), "Created session pool");
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Number of pools created so far.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Counters of every pool, keyed by destination.
    #[must_use]
    pub fn stats(&self) -> Vec<(SessionKey, PoolStats)> {
        self.pools.lock().iter().map(|(key, pool)| (key.clone(), pool.stats())).collect()
    }

    /// Closes and forgets every pool.
    pub async fn close_all(&self) {
        let pools: Vec<SessionPool> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close().await;
        }
    }

    fn factory(&self, key: SessionKey, target: RemoteTarget) -> SessionFactory {
        let connector = Arc::clone(&self.connector);
        let key = Arc::new(key);
        Arc::new(move || SessionAdapter::new(connector.create(key.protocol, &target), Arc::clone(&key)))
    }
}
