//! CMC enrollment request encoding for Windows Certificate Authorities.
//!
//! Windows CAs configured for CMC enrollment reject raw CRMF input. This crate
//! converts a caller-supplied CRMF `CertReqMessages` into the CMS-signed CMC
//! request the CA's enrollment service accepts, with the certificate template
//! carried as a request extension.
//!
//! # Structure
//!
//! ```text
//! ContentInfo (signedData)
//! └── SignedData v3
//!     ├── digestAlgorithms { sha256 }
//!     ├── encapContentInfo (id-cct-PKIData)
//!     │   └── PKIData
//!     │       ├── controlSequence  {}
//!     │       ├── reqSequence
//!     │       │   └── [0] TaggedCertificationRequest (bodyPartID 0)
//!     │       │       └── CertificationRequest
//!     │       │           ├── CertificationRequestInfo
//!     │       │           │   ├── subject, subjectPKInfo   (from CRMF)
//!     │       │           │   └── extensionRequest { template ext, CRMF exts }
//!     │       │           ├── sha256
//!     │       │           └── sha256(CertificationRequestInfo)
//!     │       ├── cmsSequence      {}
//!     │       └── otherMsgSequence {}
//!     └── signerInfos
//!         └── SignerInfo v1
//!             ├── sid        CN=<ca name>, placeholder serial
//!             ├── signedAttrs { contentType, messageDigest(PKIData) }
//!             ├── id-alg-noSignature
//!             └── sha256(signedAttrs)
//! ```
//!
//! # Template extension
//!
//! | Schema version | Extension OID            | Value                                  |
//! | -------------- | ------------------------ | -------------------------------------- |
//! | `1`            | `1.3.6.1.4.1.311.20.2`   | template name as `BMPString`           |
//! | anything else  | `1.3.6.1.4.1.311.21.7`   | `{ templateID, major, minor }`         |
//!
//! # Example
//!
//! ```no_run
//! use adcs_connector_cmc::{CmcEncoder, TemplateExtension};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let crmf_b64 = std::fs::read_to_string("request.b64")?;
//! let template = TemplateExtension::select("2", "WebServer", "1.3.6.1.4.1.311.21.8.1", "100.4")?;
//! let cmc_b64 = CmcEncoder::new().encode(&crmf_b64, "Issuing CA", &template)?;
//! # let _ = cmc_b64;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// CRMF (RFC 4211) request structures.
#[allow(missing_docs)]
pub mod crmf;
mod encoder;
mod error;
/// Object identifiers used in the envelope.
pub mod oid;
/// CMC `PKIData` structures.
#[allow(missing_docs)]
pub mod pki_data;
mod template;

#[cfg(test)]
mod testvectors;

pub use encoder::{CmcEncoder, PLACEHOLDER_SERIAL};
pub use error::{BoxError, CmcError, Result};
pub use template::{CertificateTemplateOid, LEGACY_SCHEMA_VERSION, TemplateExtension};
