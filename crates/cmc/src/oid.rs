//! Object identifiers used by the CMC enrollment envelope.

use const_oid::ObjectIdentifier;

/// `id-signedData` (1.2.840.113549.1.7.2).
pub const SIGNED_DATA: ObjectIdentifier = const_oid::db::rfc5911::ID_SIGNED_DATA;

/// `id-cct-PKIData` (1.3.6.1.5.5.7.12.2).
pub const PKI_DATA: ObjectIdentifier = const_oid::db::rfc5912::ID_CCT_PKI_DATA;

/// `id-sha256` (2.16.840.1.101.3.4.2.1).
pub const SHA_256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// `id-alg-noSignature` (1.3.6.1.5.5.7.6.2), the CMC placeholder signature algorithm.
pub const NO_SIGNATURE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.6.2");

/// PKCS#9 `contentType` attribute (1.2.840.113549.1.9.3).
pub const CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");

/// PKCS#9 `messageDigest` attribute (1.2.840.113549.1.9.4).
pub const MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// PKCS#9 `extensionRequest` attribute (1.2.840.113549.1.9.14).
pub const EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// `commonName` attribute type (2.5.4.3).
pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Legacy certificate template name extension, `szOID_ENROLL_CERTTYPE_EXTENSION`
/// (1.3.6.1.4.1.311.20.2). Carries the template name as a BMPString.
pub const ENROLL_CERTTYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.20.2");

/// Certificate template information extension, `szOID_CERTIFICATE_TEMPLATE`
/// (1.3.6.1.4.1.311.21.7). Carries the template OID and its version.
pub const CERTIFICATE_TEMPLATE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.21.7");
