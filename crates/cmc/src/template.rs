//! Certificate template extensions understood by the Windows CA.
//!
//! Schema version 1 templates are identified by name through the legacy
//! `szOID_ENROLL_CERTTYPE_EXTENSION`; every later schema version is identified
//! by OID and version through `szOID_CERTIFICATE_TEMPLATE`.

use std::str::FromStr;

use der::{
    Any, Encode, Sequence, Tag,
    asn1::{ObjectIdentifier, OctetString},
};
use x509_cert::ext::Extension;

use crate::{
    error::{CmcError, DerContext, Result},
    oid,
};

/// Schema version whose templates are selected by name.
pub const LEGACY_SCHEMA_VERSION: &str = "1";

/// `CertificateTemplateOID` extension value.
///
/// ```text
/// CertificateTemplateOID ::= SEQUENCE {
///     templateID              OBJECT IDENTIFIER,
///     templateMajorVersion    INTEGER (0..4294967295) OPTIONAL,
///     templateMinorVersion    INTEGER (0..4294967295) OPTIONAL
/// }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertificateTemplateOid {
    /// Template OID.
    pub template_id: ObjectIdentifier,
    /// Major template version.
    #[asn1(optional = "true")]
    pub template_major_version: Option<u64>,
    /// Minor template version.
    #[asn1(optional = "true")]
    pub template_minor_version: Option<u64>,
}

/// The template extension embedded into the certification request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TemplateExtension {
    /// Legacy template identified by its plain name.
    Name(String),
    /// Template identified by OID and `major.minor` version.
    Info {
        /// Template OID.
        oid: ObjectIdentifier,
        /// Major template version.
        major: u64,
        /// Minor template version.
        minor: u64,
    },
}

impl TemplateExtension {
    /// Chooses the extension form from the template's schema version.
    ///
    /// A version without a minor part (`"2"`) is read as minor version 0.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError::InvalidOid`] or [`CmcError::InvalidTemplateVersion`]
    /// when a non-legacy template carries a malformed OID or version.
    pub fn select(schema_version: &str, name: &str, template_oid: &str, version: &str) -> Result<Self> {
        if schema_version.trim() == LEGACY_SCHEMA_VERSION {
            return Ok(Self::Name(name.to_owned()));
        }

        let oid = ObjectIdentifier::from_str(template_oid.trim())
            .map_err(|_| CmcError::invalid_oid(template_oid))?;
        let (major, minor) = parse_version(version)?;
        Ok(Self::Info { oid, major, minor })
    }

    /// Builds the non-critical X.509 extension for this template.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError::Der`] if the extension value cannot be encoded.
    pub fn to_extension(&self) -> Result<Extension> {
        let (extn_id, value) = match self {
            Self::Name(name) => {
                let utf16: Vec<u8> = name.encode_utf16().flat_map(u16::to_be_bytes).collect();
                let bmp = Any::new(Tag::BmpString, utf16).context("template name")?;
                (oid::ENROLL_CERTTYPE, bmp.to_der().context("template name")?)
            },
            Self::Info { oid, major, minor } => {
                let info = CertificateTemplateOid {
                    template_id: *oid,
                    template_major_version: Some(*major),
                    template_minor_version: Some(*minor),
                };
                (oid::CERTIFICATE_TEMPLATE, info.to_der().context("CertificateTemplateOID")?)
            },
        };

        Ok(Extension {
            extn_id,
            critical: false,
            extn_value: OctetString::new(value).context("template extension")?,
        })
    }
}

fn parse_version(version: &str) -> Result<(u64, u64)> {
    let mut parts = version.trim().splitn(2, '.');
    let parse = |part: Option<&str>| -> Result<u64> {
        part.unwrap_or("0")
            .parse::<u64>()
            .map_err(|_| CmcError::invalid_template_version(version))
    };
    let major = parse(parts.next())?;
    let minor = parse(parts.next())?;
    Ok((major, minor))
}
