//! Certificate lifecycle operations against Windows Certificate Authorities.
//!
//! A [`CaService`] drives a CA through PowerShell scripts run on a host that
//! can reach it. Every operation renders one script with [`ScriptEncoder`],
//! runs it through a [`ScriptExecutor`] (normally the pooled
//! [`RemotingDispatcher`](adcs_connector_remoting::RemotingDispatcher)) and
//! turns the printed output back into typed records with [`ResultParser`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ CaService                                                    │
//! │   issue │ renew │ revoke │ identify │ discover │ list_*      │
//! ├───────────────┬────────────────┬─────────────────────────────┤
//! │ ScriptEncoder │ ResultParser   │ CmcEncoder (CRMF → CMC)     │
//! ├───────────────┴────────────────┴─────────────────────────────┤
//! │ ScriptExecutor         RemotingDispatcher │ test doubles     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Errors
//!
//! | Condition                                   | Error                     |
//! | ------------------------------------------- | ------------------------- |
//! | No certificate with the serial              | [`CaError::NotFound`]     |
//! | Bad input, ambiguous match, empty issuance  | [`CaError::Validation`]   |
//! | Host unreachable or script failed           | [`CaError::Remoting`]     |
//! | CRMF request cannot be converted            | [`CaError::Encoding`]     |
//! | Certificate cannot be decoded               | [`CaError::Certificate`]  |
//!
//! # Example
//!
//! ```no_run
//! use adcs_connector_ca::{CaService, ServiceConfig};
//! use adcs_connector_remoting::{AuthScheme, Credentials, RemoteTarget, RemotingConfig, RemotingDispatcher};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = RemotingDispatcher::new(RemotingConfig::default())?;
//! let service = CaService::new(dispatcher, ServiceConfig::default())?;
//! let target = RemoteTarget::new("ca01.corp.local", 5985, false, Credentials::new("svc", "pw", AuthScheme::Basic));
//!
//! for ca in service.list_authorities(&target).await? {
//!     println!("{} ({})", ca.name, ca.config_string);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod model;
mod parser;
mod revocation;
mod script;
mod serial;
mod service;

/// Service configuration.
pub use config::{DEFAULT_ISSUE_POLLING_INTERVAL, DEFAULT_ISSUE_TIMEOUT, DEFAULT_SEARCH_PAGE_SIZE, ServiceConfig};
/// Error types.
pub use error::{BoxError, CaError, Result};
/// CA, template and certificate records.
pub use model::{
    AuthorityDescriptor, CaRecord, CaSelection, CertificateRecord, DiscoveredCertificate, DiscoveryRequest,
    IdentifiedCertificate, IdentifyResponse, IssueRequest, IssuedCertificate, META_CA_NAME, META_TEMPLATE_NAME,
    MetadataEntry, RenewRequest, RequestFormat, SubmissionRecord, TemplateDescriptor,
};
/// Script output parsing.
pub use parser::ResultParser;
/// Revocation reasons.
pub use revocation::RevocationReason;
/// Script rendering.
pub use script::{DISPOSITION_MAX, DISPOSITION_MIN, ScriptEncoder, ps_literal};
/// Certificate decoding.
pub use serial::{certificate_serial, decode_certificate, normalize_base64};
/// CA operations.
pub use service::{CaService, EMPTY_CERTIFICATE_MESSAGE};
/// The executor seam, re-exported for implementors.
pub use adcs_connector_remoting::ScriptExecutor;
