//! Credentials and connection targets.
//!
//! Authority configuration stores a [`CredentialRef`] whose password is either
//! a plain string or wrapped as `{"secret": "..."}`. It is resolved once into
//! [`Credentials`], which zeroizes the secret on drop and never prints it.

use std::{fmt, str::FromStr};

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::ConfigError;

/// Default WS-Management port over HTTP.
pub const DEFAULT_HTTP_PORT: u16 = 5985;

/// Default WS-Management port over HTTPS.
pub const DEFAULT_HTTPS_PORT: u16 = 5986;

/// Transport authentication scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    /// CredSSP delegation.
    CredSsp,
    /// Kerberos.
    Kerberos,
    /// SPNEGO negotiation, answered with NTLM.
    #[default]
    Negotiate,
    /// NTLM.
    Ntlm,
    /// HTTP Basic.
    Basic,
    /// Client certificate.
    Certificate,
}

impl AuthScheme {
    /// Lower-case name used in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredSsp => "credssp",
            Self::Kerberos => "kerberos",
            Self::Negotiate => "negotiate",
            Self::Ntlm => "ntlm",
            Self::Basic => "basic",
            Self::Certificate => "certificate",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "credssp" => Ok(Self::CredSsp),
            "kerberos" => Ok(Self::Kerberos),
            "negotiate" => Ok(Self::Negotiate),
            "ntlm" => Ok(Self::Ntlm),
            "basic" => Ok(Self::Basic),
            "certificate" => Ok(Self::Certificate),
            other => Err(ConfigError::Invalid {
                field: "transport",
                reason: format!("unknown authentication scheme '{other}'"),
            }),
        }
    }
}

/// A password as stored in authority configuration.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// Plain string.
    Plain(String),
    /// Secret wrapped in an object.
    Wrapped {
        /// The secret itself.
        secret: String,
    },
}

impl SecretValue {
    fn expose(&self) -> &str {
        match self {
            Self::Plain(secret) | Self::Wrapped { secret } => secret,
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Unresolved credential attributes of an authority.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialRef {
    /// Account name.
    pub username: String,
    /// Password, plain or wrapped.
    pub password: SecretValue,
    /// Authentication scheme name; unset means Negotiate.
    #[serde(default)]
    pub transport: Option<String>,
}

impl CredentialRef {
    /// Creates a reference holding a plain password.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: SecretValue::Plain(password.into()), transport: None }
    }

    /// Sets the authentication scheme name.
    #[must_use]
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    /// Resolves the reference into usable credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the username is empty or the
    /// scheme name is unknown.
    pub fn resolve(&self) -> Result<Credentials, ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "username", reason: "must not be empty".into() });
        }
        let scheme = match self.transport.as_deref() {
            Some(name) if !name.trim().is_empty() => name.parse()?,
            _ => AuthScheme::default(),
        };
        Ok(Credentials::new(self.username.clone(), self.password.expose(), scheme))
    }
}

/// Resolved credentials.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    secret: Zeroizing<String>,
    scheme: AuthScheme,
}

impl Credentials {
    /// Creates credentials from their parts.
    #[must_use]
    pub fn new(username: impl Into<String>, secret: impl Into<String>, scheme: AuthScheme) -> Self {
        Self { username: username.into(), secret: Zeroizing::new(secret.into()), scheme }
    }

    /// Account name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Authentication scheme.
    #[must_use]
    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .field("scheme", &self.scheme)
            .finish()
    }
}

/// A WS-Management endpoint plus the credentials used to reach it.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Use HTTPS.
    pub use_tls: bool,
    /// Credentials.
    pub credentials: Credentials,
}

impl RemoteTarget {
    /// Creates a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool, credentials: Credentials) -> Self {
        Self { host: host.into(), port, use_tls, credentials }
    }

    /// WS-Management endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}/wsman", self.host, self.port)
    }
}
