//! Certificate Request Message Format (RFC 4211) structures.
//!
//! Only decoding is needed here: callers hand over a base64 `CertReqMessages`
//! (or, from older clients, a bare `CertReqMsg`) and the encoder extracts the
//! subject, public key and requested extensions of the first request.
//!
//! Tagging follows the RFC 4211 module (`IMPLICIT TAGS`); fields whose type is
//! itself a CHOICE (`Name`, `Time`, `GeneralName`, `POPOPrivKey`) are
//! necessarily encoded with explicit tags.

use base64::{Engine, engine::general_purpose::STANDARD};
use der::{
    Choice, Decode, DecodeValue, EncodeValue, FixedTag, Header, Length, Reader, Sequence, Tag,
    Writer,
    asn1::{BitString, Int, Null},
};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::{
    attr::AttributeTypeAndValue, ext::Extensions, ext::pkix::name::GeneralName, name::Name,
    time::Time,
};

use crate::error::{CmcError, DerContext, Result};

/// `CertReqMessages ::= SEQUENCE SIZE (1..MAX) OF CertReqMsg`
pub type CertReqMessages = Vec<CertReqMsg>;

/// `Controls ::= SEQUENCE SIZE(1..MAX) OF AttributeTypeAndValue`
pub type Controls = Vec<AttributeTypeAndValue>;

/// A SEQUENCE kept as its raw content octets.
///
/// Used for structures the encoder never inspects (for example the
/// `EnvelopedData` of an encrypted proof-of-possession).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawSequence(pub Vec<u8>);

impl FixedTag for RawSequence {
    const TAG: Tag = Tag::Sequence;
}

impl<'a> DecodeValue<'a> for RawSequence {
    fn decode_value<R: Reader<'a>>(reader: &mut R, header: Header) -> der::Result<Self> {
        Ok(Self(reader.read_vec(header.length)?))
    }
}

impl EncodeValue for RawSequence {
    fn value_len(&self) -> der::Result<Length> {
        Length::try_from(self.0.len())
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        writer.write(&self.0)
    }
}

/// `CertReqMsg`: one certificate request plus its proof of possession.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertReqMsg {
    pub cert_req: CertRequest,
    pub popo: Option<ProofOfPossession>,
    pub reg_info: Option<Vec<AttributeTypeAndValue>>,
}

/// `CertRequest`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertRequest {
    pub cert_req_id: Int,
    pub cert_template: CertTemplate,
    pub controls: Option<Controls>,
}

/// `CertTemplate`: every field is optional; the encoder requires
/// `subject` and `public_key`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Sequence)]
pub struct CertTemplate {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub version: Option<Int>,
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", optional = "true")]
    pub serial_number: Option<Int>,
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT", optional = "true")]
    pub signing_alg: Option<AlgorithmIdentifierOwned>,
    #[asn1(context_specific = "3", tag_mode = "EXPLICIT", optional = "true")]
    pub issuer: Option<Name>,
    #[asn1(context_specific = "4", tag_mode = "IMPLICIT", optional = "true")]
    pub validity: Option<OptionalValidity>,
    #[asn1(context_specific = "5", tag_mode = "EXPLICIT", optional = "true")]
    pub subject: Option<Name>,
    #[asn1(context_specific = "6", tag_mode = "IMPLICIT", optional = "true")]
    pub public_key: Option<SubjectPublicKeyInfoOwned>,
    #[asn1(context_specific = "7", tag_mode = "IMPLICIT", optional = "true")]
    pub issuer_uid: Option<BitString>,
    #[asn1(context_specific = "8", tag_mode = "IMPLICIT", optional = "true")]
    pub subject_uid: Option<BitString>,
    #[asn1(context_specific = "9", tag_mode = "IMPLICIT", optional = "true")]
    pub extensions: Option<Extensions>,
}

/// `OptionalValidity`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OptionalValidity {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub not_before: Option<Time>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    pub not_after: Option<Time>,
}

/// `ProofOfPossession`
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum ProofOfPossession {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    RaVerified(Null),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", constructed = "true")]
    Signature(PopoSigningKey),
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", constructed = "true")]
    KeyEncipherment(PopoPrivKey),
    #[asn1(context_specific = "3", tag_mode = "EXPLICIT", constructed = "true")]
    KeyAgreement(PopoPrivKey),
}

/// `POPOSigningKey`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PopoSigningKey {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", optional = "true")]
    pub poposk_input: Option<PopoSigningKeyInput>,
    pub algorithm_identifier: AlgorithmIdentifierOwned,
    pub signature: BitString,
}

/// `POPOSigningKeyInput`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PopoSigningKeyInput {
    pub auth_info: AuthInfo,
    pub public_key: SubjectPublicKeyInfoOwned,
}

/// The `authInfo` CHOICE of `POPOSigningKeyInput`.
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum AuthInfo {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", constructed = "true")]
    Sender(GeneralName),
    PublicKeyMac(PkMacValue),
}

/// `PKMACValue`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct PkMacValue {
    pub alg_id: AlgorithmIdentifierOwned,
    pub value: BitString,
}

/// `POPOPrivKey`
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum PopoPrivKey {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    ThisMessage(BitString),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT")]
    SubsequentMessage(Int),
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT")]
    DhMac(BitString),
    #[asn1(context_specific = "3", tag_mode = "IMPLICIT", constructed = "true")]
    AgreeMac(PkMacValue),
    #[asn1(context_specific = "4", tag_mode = "IMPLICIT", constructed = "true")]
    EncryptedKey(RawSequence),
}

/// Fields of the first request that the certification request is built from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestedCertificate {
    pub subject: Name,
    pub public_key: SubjectPublicKeyInfoOwned,
    pub extensions: Extensions,
}

impl CertReqMsg {
    /// Extracts subject, public key and requested extensions from the template.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError::MissingField`] when the template lacks a subject or
    /// a public key.
    pub fn requested_certificate(&self) -> Result<RequestedCertificate> {
        let template = &self.cert_req.cert_template;
        let subject = template.subject.clone().ok_or(CmcError::missing_field("subject"))?;
        let public_key =
            template.public_key.clone().ok_or(CmcError::missing_field("publicKey"))?;
        Ok(RequestedCertificate {
            subject,
            public_key,
            extensions: template.extensions.clone().unwrap_or_default(),
        })
    }
}

/// Decodes the first `CertReqMsg` from DER bytes.
///
/// `CertReqMessages` is tried first; a bare `CertReqMsg` is accepted as a
/// fallback.
///
/// # Errors
///
/// Returns [`CmcError::EmptyRequest`] for an empty message sequence and
/// [`CmcError::Der`] when neither form decodes.
pub fn decode_first_request(der_bytes: &[u8]) -> Result<CertReqMsg> {
    match CertReqMessages::from_der(der_bytes) {
        Ok(messages) => messages.into_iter().next().ok_or(CmcError::EmptyRequest),
        Err(err) => {
            tracing::debug!(error = %err, "input is not CertReqMessages, trying CertReqMsg");
            CertReqMsg::from_der(der_bytes).context("CertReqMsg")
        },
    }
}

/// Decodes a base64 CRMF request and returns its first `CertReqMsg`.
///
/// Whitespace (line breaks from PEM-like wrapping) is ignored.
///
/// # Errors
///
/// Returns [`CmcError::Base64`] for malformed base64, otherwise the errors of
/// [`decode_first_request`].
pub fn decode_base64_request(encoded: &str) -> Result<CertReqMsg> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der_bytes = STANDARD.decode(compact.as_bytes()).map_err(CmcError::base64)?;
    decode_first_request(&der_bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use der::Encode;

    use super::*;
    use crate::testvectors::CRMF_REQUEST;

    #[test]
    fn test_decode_cert_req_messages() {
        let msg = decode_base64_request(CRMF_REQUEST).unwrap();
        let requested = msg.requested_certificate().unwrap();

        let common_name = requested
            .subject
            .0
            .iter()
            .flat_map(|rdn| rdn.0.iter())
            .find(|atv| atv.oid == crate::oid::COMMON_NAME)
            .expect("subject has a common name");
        assert_eq!(common_name.value.value(), b"develop.localhost.localdomain");
        assert!(requested.extensions.is_empty());
        assert!(matches!(msg.popo, Some(ProofOfPossession::Signature(_))));
        assert!(msg.cert_req.cert_template.issuer.is_some());
    }

    #[test]
    fn test_decode_single_cert_req_msg_fallback() {
        let msg = decode_base64_request(CRMF_REQUEST).unwrap();
        let single = msg.to_der().unwrap();

        let decoded = decode_first_request(&single).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_empty_messages() {
        // SEQUENCE {}
        let result = decode_first_request(&[0x30, 0x00]);
        assert!(matches!(result, Err(CmcError::EmptyRequest)));
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode_first_request(&[0x04, 0x01, 0x00]);
        assert!(matches!(result, Err(CmcError::Der { .. })));
    }

    #[test]
    fn test_invalid_base64() {
        let result = decode_base64_request("not base64!");
        assert!(matches!(result, Err(CmcError::Base64 { .. })));
    }

    #[test]
    fn test_missing_public_key() {
        let msg = decode_base64_request(CRMF_REQUEST).unwrap();
        let mut stripped = msg.clone();
        stripped.cert_req.cert_template.public_key = None;

        let err = stripped.requested_certificate().unwrap_err();
        assert!(matches!(err, CmcError::MissingField { field: "publicKey" }));
    }

    #[test]
    fn test_whitespace_in_base64_is_ignored() {
        let wrapped: String = CRMF_REQUEST
            .as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(decode_base64_request(&wrapped).is_ok());
    }
}
