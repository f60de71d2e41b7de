//! Revocation reasons and their CA representations.

use std::{convert::Infallible, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// RFC 5280 revocation reason as named by callers.
///
/// Unknown names map to [`RevocationReason::Unspecified`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RevocationReason {
    /// `unspecified`
    #[default]
    Unspecified,
    /// `keyCompromise`
    KeyCompromise,
    /// `cACompromise`
    CaCompromise,
    /// `affiliationChanged`
    AffiliationChanged,
    /// `superseded`
    Superseded,
    /// `cessationOfOperation`
    CessationOfOperation,
    /// `certificateHold`
    CertificateHold,
    /// `removeFromCRL`
    RemoveFromCrl,
    /// `privilegeWithdrawn`
    PrivilegeWithdrawn,
    /// `aACompromise`
    AaCompromise,
}

impl RevocationReason {
    /// Every reason, in CRL code order.
    pub const ALL: [Self; 10] = [
        Self::Unspecified,
        Self::KeyCompromise,
        Self::CaCompromise,
        Self::AffiliationChanged,
        Self::Superseded,
        Self::CessationOfOperation,
        Self::CertificateHold,
        Self::RemoveFromCrl,
        Self::PrivilegeWithdrawn,
        Self::AaCompromise,
    ];

    /// Parses a caller-supplied reason name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self::ALL.into_iter().find(|reason| reason.as_str() == name.trim()).unwrap_or_default()
    }

    /// Caller-facing name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "keyCompromise",
            Self::CaCompromise => "cACompromise",
            Self::AffiliationChanged => "affiliationChanged",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessationOfOperation",
            Self::CertificateHold => "certificateHold",
            Self::RemoveFromCrl => "removeFromCRL",
            Self::PrivilegeWithdrawn => "privilegeWithdrawn",
            Self::AaCompromise => "aACompromise",
        }
    }

    /// CRL reason code passed to `ICertAdmin::RevokeCertificate`.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    /// Reason name understood by the PowerShell PKI module's
    /// `Revoke-Certificate -Reason`. Reasons the module cannot express fall
    /// back to `Unspecified`.
    #[must_use]
    pub fn ps_name(self) -> &'static str {
        match self {
            Self::KeyCompromise => "KeyCompromise",
            Self::CaCompromise => "CACompromise",
            Self::AffiliationChanged => "AffiliationChanged",
            Self::Superseded => "Superseded",
            Self::CessationOfOperation => "CeaseOfOperation",
            Self::CertificateHold => "Hold",
            Self::Unspecified | Self::RemoveFromCrl | Self::PrivilegeWithdrawn | Self::AaCompromise => "Unspecified",
        }
    }

    /// Whether the CA ignores the revocation date for this reason.
    #[must_use]
    pub fn ignores_date(self) -> bool {
        self == Self::RemoveFromCrl
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl From<String> for RevocationReason {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<RevocationReason> for String {
    fn from(reason: RevocationReason) -> Self {
        reason.as_str().to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let codes: Vec<u8> = RevocationReason::ALL.iter().map(|r| r.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 6, 8, 9, 10]);
    }

    #[test]
    fn test_names_round_trip() {
        for reason in RevocationReason::ALL {
            assert_eq!(RevocationReason::from_name(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_unknown_is_unspecified() {
        assert_eq!(RevocationReason::from_name("bogus"), RevocationReason::Unspecified);
        assert_eq!("KEYCOMPROMISE".parse::<RevocationReason>().unwrap(), RevocationReason::Unspecified);
    }

    #[test]
    fn test_ps_names() {
        assert_eq!(RevocationReason::CessationOfOperation.ps_name(), "CeaseOfOperation");
        assert_eq!(RevocationReason::CertificateHold.ps_name(), "Hold");
        assert_eq!(RevocationReason::AaCompromise.ps_name(), "Unspecified");
    }

    #[test]
    fn test_serde_uses_names() {
        let json = serde_json::to_string(&RevocationReason::KeyCompromise).unwrap();
        assert_eq!(json, "\"keyCompromise\"");
        let parsed: RevocationReason = serde_json::from_str("\"removeFromCRL\"").unwrap();
        assert!(parsed.ignores_date());
    }
}
