//! Pool identity.

use std::fmt;

use crate::{
    credentials::{AuthScheme, RemoteTarget},
    session::Protocol,
};

/// Identifies the one pool serving a destination.
///
/// Two operations against the same host, port, account and scheme over the
/// same protocol always resolve to the same key and therefore share a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Host name, lower-cased.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// HTTPS.
    pub use_tls: bool,
    /// Account name.
    pub username: String,
    /// Authentication scheme.
    pub scheme: AuthScheme,
}

impl SessionKey {
    /// Builds the key for `target` over `protocol`.
    #[must_use]
    pub fn new(protocol: Protocol, target: &RemoteTarget) -> Self {
        Self {
            protocol,
            host: target.host.to_ascii_lowercase(),
            port: target.port,
            use_tls: target.use_tls,
            username: target.credentials.username().to_owned(),
            scheme: target.credentials.scheme(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tls = if self.use_tls { "+tls" } else { "" };
        write!(f, "{}{tls}://{}@{}:{}/{}", self.protocol, self.username, self.host, self.port, self.scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;

    fn target(host: &str, user: &str) -> RemoteTarget {
        RemoteTarget::new(host, 5985, false, Credentials::new(user, "pw", AuthScheme::Basic))
    }

    #[test]
    fn test_same_destination_same_key() {
        let a = SessionKey::new(Protocol::WinRm, &target("CA01.corp", "svc"));
        let b = SessionKey::new(Protocol::WinRm, &target("ca01.corp", "svc"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_protocol_and_identity_distinguish_keys() {
        let base = SessionKey::new(Protocol::WinRm, &target("ca01", "svc"));
        assert_ne!(base, SessionKey::new(Protocol::Psrp, &target("ca01", "svc")));
        assert_ne!(base, SessionKey::new(Protocol::WinRm, &target("ca01", "other")));
    }

    #[test]
    fn test_display() {
        let key = SessionKey::new(Protocol::Psrp, &target("ca01", "svc"));
        assert_eq!(key.to_string(), "psrp://svc@ca01:5985/basic");
    }
}
