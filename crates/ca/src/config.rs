//! CA operation settings.

use std::time::Duration;

use adcs_connector_remoting::ConfigError;
use serde::{Deserialize, Serialize};

/// Default number of certificates fetched per discovery page.
pub const DEFAULT_SEARCH_PAGE_SIZE: u32 = 1000;

/// Default interval between pending-request polls (100 ms).
pub const DEFAULT_ISSUE_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Default time an issuance may stay pending before it fails (3 seconds).
pub const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Settings shared by every [`CaService`](crate::CaService) operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Certificates fetched per discovery page.
    #[serde(default = "default_search_page_size")]
    pub(crate) search_page_size: u32,

    /// Interval between polls of a pending request.
    #[serde(with = "humantime_serde", default = "default_issue_polling_interval")]
    pub(crate) issue_polling_interval: Duration,

    /// How long a request may stay pending.
    #[serde(with = "humantime_serde", default = "default_issue_timeout")]
    pub(crate) issue_timeout: Duration,
}

fn default_search_page_size() -> u32 {
    DEFAULT_SEARCH_PAGE_SIZE
}

fn default_issue_polling_interval() -> Duration {
    DEFAULT_ISSUE_POLLING_INTERVAL
}

fn default_issue_timeout() -> Duration {
    DEFAULT_ISSUE_TIMEOUT
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            search_page_size: DEFAULT_SEARCH_PAGE_SIZE,
            issue_polling_interval: DEFAULT_ISSUE_POLLING_INTERVAL,
            issue_timeout: DEFAULT_ISSUE_TIMEOUT,
        }
    }
}

#[bon::bon]
impl ServiceConfig {
    /// Creates a new service configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `search_page_size` is zero
    /// - `issue_polling_interval` or `issue_timeout` is zero
    /// - `issue_polling_interval` exceeds `issue_timeout`
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_SEARCH_PAGE_SIZE)] search_page_size: u32,
        #[builder(default = DEFAULT_ISSUE_POLLING_INTERVAL)] issue_polling_interval: Duration,
        #[builder(default = DEFAULT_ISSUE_TIMEOUT)] issue_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { search_page_size, issue_polling_interval, issue_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder.
    ///
    /// # Errors
    ///
    /// See [`ServiceConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search_page_size == 0 {
            return Err(ConfigError::BelowMinimum { field: "search_page_size", min: "1".into(), value: "0".into() });
        }
        if self.issue_polling_interval.is_zero() {
            return Err(ConfigError::MustBePositive { field: "issue_polling_interval", value: "0s".into() });
        }
        if self.issue_timeout.is_zero() {
            return Err(ConfigError::MustBePositive { field: "issue_timeout", value: "0s".into() });
        }
        if self.issue_polling_interval > self.issue_timeout {
            return Err(ConfigError::AboveMaximum {
                field: "issue_polling_interval",
                max: format!("{}ms", self.issue_timeout.as_millis()),
                value: format!("{}ms", self.issue_polling_interval.as_millis()),
            });
        }
        Ok(())
    }

    /// Returns the discovery page size.
    #[must_use]
    pub fn search_page_size(&self) -> u32 {
        self.search_page_size
    }

    /// Returns the pending-request polling interval.
    #[must_use]
    pub fn issue_polling_interval(&self) -> Duration {
        self.issue_polling_interval
    }

    /// Returns the pending-request timeout.
    #[must_use]
    pub fn issue_timeout(&self) -> Duration {
        self.issue_timeout
    }
}
