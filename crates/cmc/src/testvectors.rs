//! Shared test inputs.

/// A `CertReqMessages` with one RSA-2048 request for
/// `O=tocecz, CN=develop.localhost.localdomain, E=root@localhost.localdomain`.
pub(crate) const CRMF_REQUEST: &str = include_str!("../tests/data/crmf_request.b64");
