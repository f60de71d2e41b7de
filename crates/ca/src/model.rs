//! Typed CA, template and certificate records.

use std::{fmt, str::FromStr};

use adcs_connector_cmc::{CmcError, LEGACY_SCHEMA_VERSION, TemplateExtension};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{CaError, Result};

/// Metadata name carrying the CA a certificate was found on.
pub const META_CA_NAME: &str = "metadata_ca_name";

/// Metadata name carrying the certificate's template.
pub const META_TEMPLATE_NAME: &str = "metadata_template_name";

/// One Certificate Authority as reported by the host or built from a config
/// string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityDescriptor {
    /// CA common name.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// Host running the CA.
    pub computer_name: String,
    /// `host\caName`, the form every CA COM interface accepts.
    pub config_string: String,
    /// CA type, for example `Enterprise Root CA`. Empty when unknown.
    #[serde(default)]
    pub ca_type: String,
    /// Enterprise (AD-integrated) CA.
    #[serde(default)]
    pub is_enterprise: bool,
    /// Root CA.
    #[serde(default)]
    pub is_root: bool,
    /// Whether the CA answered when listed.
    #[serde(default)]
    pub is_accessible: bool,
    /// Service status, empty when the CA did not answer.
    #[serde(default)]
    pub service_status: String,
}

/// A CA record produced by the result parser.
pub type CaRecord = AuthorityDescriptor;

impl AuthorityDescriptor {
    /// Builds a descriptor from a `host\caName` config string.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] unless the string has exactly two
    /// non-empty parts.
    pub fn from_config_string(config_string: &str) -> Result<Self> {
        let (host, name) = split_config_string(config_string)?;
        Ok(Self {
            name: name.to_owned(),
            display_name: name.to_owned(),
            computer_name: host.to_owned(),
            config_string: config_string.to_owned(),
            ..Self::default()
        })
    }
}

/// Splits and validates a `host\caName` config string.
pub(crate) fn split_config_string(config_string: &str) -> Result<(&str, &str)> {
    let mut parts = config_string.split('\\');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(name), None)
            if !host.trim().is_empty()
                && !name.trim().is_empty()
                && !config_string.chars().any(char::is_control) =>
        {
            Ok((host, name))
        },
        _ => Err(CaError::validation(format!("Wrong format of ConfigString: {config_string}"))),
    }
}

/// How an operation picks its CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaSelection {
    /// A CA previously returned by a search.
    Search(AuthorityDescriptor),
    /// A `host\caName` config string.
    ConfigString(String),
}

impl CaSelection {
    /// Resolves the selection to a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::Validation`] for a malformed config string.
    pub fn resolve(&self) -> Result<AuthorityDescriptor> {
        match self {
            Self::Search(descriptor) => Ok(descriptor.clone()),
            Self::ConfigString(config_string) => AuthorityDescriptor::from_config_string(config_string),
        }
    }
}

/// A certificate template published in Active Directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDescriptor {
    /// Template common name.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    /// `msPKI-Template-Schema-Version`; `"1"` marks a legacy template.
    pub schema_version: String,
    /// `major.minor` revision, absent for some legacy templates.
    #[serde(default)]
    pub version: Option<String>,
    /// Template OID.
    pub oid: String,
}

impl TemplateDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        schema_version: impl Into<String>,
        version: impl Into<String>,
        oid: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            schema_version: schema_version.into(),
            version: Some(version.into()),
            oid: oid.into(),
        }
    }

    /// Whether the CA identifies this template by name.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.schema_version.trim() == LEGACY_SCHEMA_VERSION
    }

    /// The value the CA database stores in `CertificateTemplate` for
    /// certificates of this template.
    #[must_use]
    pub fn database_value(&self) -> &str {
        if self.is_legacy() { &self.name } else { &self.oid }
    }

    /// Whether a `CertificateTemplate` value read from the CA refers to this
    /// template, by OID or by name.
    #[must_use]
    pub fn matches(&self, certificate_template: &str) -> bool {
        let value = certificate_template.trim();
        (!self.oid.is_empty() && value == self.oid) || (!self.name.is_empty() && value == self.name)
    }

    /// The request extension announcing this template to the CA.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError`] for a malformed OID or version.
    pub fn extension(&self) -> std::result::Result<TemplateExtension, CmcError> {
        TemplateExtension::select(
            &self.schema_version,
            &self.name,
            &self.oid,
            self.version.as_deref().unwrap_or("0"),
        )
    }
}

/// Encoding of the request submitted for issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestFormat {
    /// PKCS#10, submitted as is.
    Pkcs10,
    /// CRMF, converted to CMC before submission.
    Crmf,
}

impl RequestFormat {
    /// Wire name of the format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pkcs10 => "pkcs10",
            Self::Crmf => "crmf",
        }
    }
}

impl fmt::Display for RequestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestFormat {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pkcs10" => Ok(Self::Pkcs10),
            "crmf" => Ok(Self::Crmf),
            _ => Err(CaError::validation(format!("Certificate request format '{s}' is not supported."))),
        }
    }
}

/// A certificate found by a discovery query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// `CertificateTemplate` column: template name or OID.
    pub template: String,
    /// DER certificate, base64 without line breaks.
    pub certificate_b64: String,
}

/// A row returned by the identify query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifiedCertificate {
    /// `CertificateTemplate` column.
    pub certificate_template: String,
    /// Serial number as stored by the CA.
    pub serial_number: String,
    /// Config string of the CA that holds the row.
    pub config_string: String,
}

/// Output of the submit script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// CA request id.
    pub request_id: Option<i64>,
    /// Final disposition.
    pub disposition: Option<i64>,
    /// Issued certificate, base64 DER.
    pub certificate_b64: Option<String>,
}

/// A name/value pair attached to a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Metadata name.
    pub name: String,
    /// Metadata value.
    pub value: String,
}

impl MetadataEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Issuance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    /// Issuing CA.
    pub ca: CaSelection,
    /// Template to enroll against.
    pub template: TemplateDescriptor,
    /// Base64 request in `format`.
    pub request: String,
    /// Request encoding.
    pub format: RequestFormat,
}

/// Renewal request: a fresh issuance for an existing certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewRequest {
    /// The certificate being renewed, base64 DER.
    pub certificate_b64: String,
    /// The new issuance.
    pub issue: IssueRequest,
}

/// An issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Issued certificate, base64 DER.
    pub certificate_b64: String,
    /// CA request id, when reported.
    pub request_id: Option<i64>,
    /// Final disposition, when reported.
    pub disposition: Option<i64>,
}

/// Result of identifying a certificate on its CA.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// Metadata to attach to the certificate. Currently always empty.
    pub meta: Vec<MetadataEntry>,
}

/// Discovery scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// CAs to search; empty searches every CA the host can see.
    #[serde(default)]
    pub authorities: Vec<CaSelection>,
    /// Templates to restrict to; empty means any template.
    #[serde(default)]
    pub templates: Vec<TemplateDescriptor>,
    /// Only certificates valid from this date on.
    #[serde(default)]
    pub issued_after: Option<NaiveDate>,
}

/// A certificate found by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCertificate {
    /// DER certificate, base64.
    pub certificate_b64: String,
    /// CA name and template name.
    pub meta: Vec<MetadataEntry>,
}

impl DiscoveredCertificate {
    /// Attaches CA and template metadata to a found certificate.
    #[must_use]
    pub fn new(ca_name: &str, record: CertificateRecord) -> Self {
        Self {
            meta: vec![MetadataEntry::new(META_CA_NAME, ca_name), MetadataEntry::new(META_TEMPLATE_NAME, record.template)],
            certificate_b64: record.certificate_b64,
        }
    }

    /// Value of the metadata entry named `name`.
    #[must_use]
    pub fn meta_value(&self, name: &str) -> Option<&str> {
        self.meta.iter().find(|entry| entry.name == name).map(|entry| entry.value.as_str())
    }
}
