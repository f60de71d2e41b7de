//! Pool and transport configuration.
//!
//! Every struct is built through a validating `bon` builder and also
//! deserializes from configuration files, with durations written as
//! human-readable strings (`"25s"`, `"10m"`).
//!
//! ```
//! use std::time::Duration;
//!
//! use adcs_connector_remoting::PoolConfig;
//!
//! let config = PoolConfig::builder()
//!     .max_size(4)
//!     .min_warm(2)
//!     .keepalive_interval(Duration::from_secs(30))
//!     .build()?;
//! assert_eq!(config.max_size(), 4);
//! # Ok::<(), adcs_connector_remoting::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default maximum sessions in a stand-alone pool.
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;

/// Default maximum sessions in pools created by the pool manager.
pub const DEFAULT_MANAGER_MAX_SIZE: usize = 8;

/// Default number of sessions kept warm.
pub const DEFAULT_MIN_WARM: usize = 1;

/// Default keep-alive interval (25 seconds).
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Default idle duration after which surplus sessions are trimmed (10 minutes).
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(600);

/// Shortest interval between maintainer sweeps (5 seconds).
pub const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Default HTTP request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default WS-Management `OperationTimeout` (60 seconds).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default WS-Management `MaxEnvelopeSize` in bytes.
pub const DEFAULT_MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Smallest accepted `MaxEnvelopeSize` in bytes.
pub const MIN_MAX_ENVELOPE_SIZE: u32 = 8_192;

/// Default shell code page (UTF-8).
pub const DEFAULT_CODEPAGE: u32 = 65_001;

/// Configuration of one [`SessionPool`](crate::SessionPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum sessions (idle plus borrowed).
    #[serde(default = "default_pool_max_size")]
    pub(crate) max_size: usize,

    /// Sessions the warmer and maintainer keep available.
    #[serde(default = "default_min_warm")]
    pub(crate) min_warm: usize,

    /// Keep-alive ping interval for idle sessions.
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub(crate) keepalive_interval: Duration,

    /// Idle duration after which surplus sessions are trimmed; `None` never trims.
    #[serde(with = "humantime_serde", default = "default_max_idle")]
    pub(crate) max_idle: Option<Duration>,

    /// How long `acquire` waits for a session; `None` waits indefinitely.
    #[serde(with = "humantime_serde", default)]
    pub(crate) acquire_timeout: Option<Duration>,

    /// Start the warmer at construction instead of on first acquire.
    #[serde(default)]
    pub(crate) eager_warm: bool,
}

fn default_pool_max_size() -> usize {
    DEFAULT_POOL_MAX_SIZE
}

fn default_min_warm() -> usize {
    DEFAULT_MIN_WARM
}

fn default_keepalive_interval() -> Duration {
    DEFAULT_KEEPALIVE_INTERVAL
}

fn default_max_idle() -> Option<Duration> {
    Some(DEFAULT_MAX_IDLE)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            min_warm: DEFAULT_MIN_WARM,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_idle: Some(DEFAULT_MAX_IDLE),
            acquire_timeout: None,
            eager_warm: false,
        }
    }
}

#[bon::bon]
impl PoolConfig {
    /// Creates a new pool configuration.
    ///
    /// # Errors
    ///
    /// An unset `max_idle` means [`DEFAULT_MAX_IDLE`]; see
    /// [`PoolConfig::without_idle_trim`] to disable trimming.
    ///
    /// Returns [`ConfigError`] if:
    /// - `max_size` is zero
    /// - `min_warm` exceeds `max_size`
    /// - `keepalive_interval`, `max_idle` or `acquire_timeout` is zero
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_POOL_MAX_SIZE)] max_size: usize,
        #[builder(default = DEFAULT_MIN_WARM)] min_warm: usize,
        #[builder(default = DEFAULT_KEEPALIVE_INTERVAL)] keepalive_interval: Duration,
        max_idle: Option<Duration>,
        acquire_timeout: Option<Duration>,
        #[builder(default)] eager_warm: bool,
    ) -> Result<Self, ConfigError> {
        let max_idle = Some(max_idle.unwrap_or(DEFAULT_MAX_IDLE));
        let config =
            Self { max_size, min_warm, keepalive_interval, max_idle, acquire_timeout, eager_warm };
        config.validate()?;
        Ok(config)
    }

    /// Disables idle trimming; idle sessions are then only removed when a
    /// keep-alive ping fails.
    #[must_use]
    pub fn without_idle_trim(mut self) -> Self {
        self.max_idle = None;
        self
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// Deserialized configurations skip the builder, so consumers call this
    /// before use.
    ///
    /// # Errors
    ///
    /// See [`PoolConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "max_size",
                min: "1".into(),
                value: "0".into(),
            });
        }
        if self.min_warm > self.max_size {
            return Err(ConfigError::AboveMaximum {
                field: "min_warm",
                max: self.max_size.to_string(),
                value: self.min_warm.to_string(),
            });
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "keepalive_interval", value: "0s".into() });
        }
        if self.max_idle.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::MustBePositive { field: "max_idle", value: "0s".into() });
        }
        if self.acquire_timeout.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::MustBePositive { field: "acquire_timeout", value: "0s".into() });
        }
        Ok(())
    }

    /// Returns the maximum pool size.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the warm floor.
    #[must_use]
    pub fn min_warm(&self) -> usize {
        self.min_warm
    }

    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Returns the idle trim threshold.
    #[must_use]
    pub fn max_idle(&self) -> Option<Duration> {
        self.max_idle
    }

    /// Returns the default acquire timeout.
    #[must_use]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    /// Returns whether warm-up starts at construction.
    #[must_use]
    pub fn eager_warm(&self) -> bool {
        self.eager_warm
    }

    /// Interval between maintainer sweeps: the keep-alive interval, but never
    /// shorter than [`MIN_MAINTENANCE_INTERVAL`].
    #[must_use]
    pub fn maintenance_interval(&self) -> Duration {
        self.keepalive_interval.max(MIN_MAINTENANCE_INTERVAL)
    }
}

/// WS-Management transport settings shared by both session kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// HTTP request timeout.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub(crate) request_timeout: Duration,

    /// WS-Management `OperationTimeout` sent with every request.
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub(crate) operation_timeout: Duration,

    /// WS-Management `MaxEnvelopeSize`.
    #[serde(default = "default_max_envelope_size")]
    pub(crate) max_envelope_size: u32,

    /// Shell code page.
    #[serde(default = "default_codepage")]
    pub(crate) codepage: u32,

    /// Accept TLS certificates that fail validation.
    #[serde(default)]
    pub(crate) accept_invalid_certs: bool,
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_operation_timeout() -> Duration {
    DEFAULT_OPERATION_TIMEOUT
}

fn default_max_envelope_size() -> u32 {
    DEFAULT_MAX_ENVELOPE_SIZE
}

fn default_codepage() -> u32 {
    DEFAULT_CODEPAGE
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            codepage: DEFAULT_CODEPAGE,
            accept_invalid_certs: false,
        }
    }
}

#[bon::bon]
impl TransportConfig {
    /// Creates a new transport configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a timeout is zero or `max_envelope_size` is
    /// below [`MIN_MAX_ENVELOPE_SIZE`].
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = DEFAULT_OPERATION_TIMEOUT)] operation_timeout: Duration,
        #[builder(default = DEFAULT_MAX_ENVELOPE_SIZE)] max_envelope_size: u32,
        #[builder(default = DEFAULT_CODEPAGE)] codepage: u32,
        #[builder(default)] accept_invalid_certs: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            request_timeout,
            operation_timeout,
            max_envelope_size,
            codepage,
            accept_invalid_certs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`TransportConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "request_timeout", value: "0s".into() });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "operation_timeout", value: "0s".into() });
        }
        if self.max_envelope_size < MIN_MAX_ENVELOPE_SIZE {
            return Err(ConfigError::BelowMinimum {
                field: "max_envelope_size",
                min: MIN_MAX_ENVELOPE_SIZE.to_string(),
                value: self.max_envelope_size.to_string(),
            });
        }
        Ok(())
    }

    /// Returns the HTTP request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Returns the WS-Management operation timeout.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Returns the maximum envelope size.
    #[must_use]
    pub fn max_envelope_size(&self) -> u32 {
        self.max_envelope_size
    }

    /// Returns the shell code page.
    #[must_use]
    pub fn codepage(&self) -> u32 {
        self.codepage
    }

    /// Returns whether invalid TLS certificates are accepted.
    #[must_use]
    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }
}

/// Top-level remoting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemotingConfig {
    /// Route scripts through session pools. When disabled every script opens
    /// and closes its own session.
    #[serde(default = "default_pool_enabled")]
    pub pool_enabled: bool,

    /// Configuration applied to every pool the manager creates.
    #[serde(default = "default_manager_pool")]
    pub pool: PoolConfig,

    /// Transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_pool_enabled() -> bool {
    true
}

fn default_manager_pool() -> PoolConfig {
    PoolConfig { max_size: DEFAULT_MANAGER_MAX_SIZE, ..PoolConfig::default() }
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self { pool_enabled: true, pool: default_manager_pool(), transport: TransportConfig::default() }
    }
}

impl RemotingConfig {
    /// Validates the nested configurations.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.transport.validate()
    }
}
