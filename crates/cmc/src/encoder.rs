//! Builds the CMS-signed CMC request submitted to the CA.
//!
//! The envelope is structurally complete but carries placeholder signatures:
//! the certification request is "signed" with the SHA-256 digest of its
//! `CertificationRequestInfo`, and the signer info with the SHA-256 digest of
//! its signed attributes. Trust in the request comes from the authenticated
//! remote session that submits it, not from these fields.

use base64::{Engine, engine::general_purpose::STANDARD};
use cms::{
    cert::IssuerAndSerialNumber,
    content_info::{CmsVersion, ContentInfo},
    signed_data::{EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo, SignerInfos},
};
use der::{
    Any, Encode, Tag,
    asn1::{BitString, OctetString, SetOfVec},
};
use sha2::{Digest, Sha256};
use spki::AlgorithmIdentifierOwned;
use x509_cert::{
    attr::{Attribute, AttributeTypeAndValue},
    ext::Extensions,
    name::{Name, RdnSequence, RelativeDistinguishedName},
    request::{CertReq, CertReqInfo, Version},
    serial_number::SerialNumber,
};

use crate::{
    crmf::{self, RequestedCertificate},
    error::{DerContext, Result},
    oid,
    pki_data::{PkiData, TaggedCertificationRequest, TaggedRequest},
    template::TemplateExtension,
};

/// Serial number placed in the signer identifier. No signing certificate
/// exists, so any fixed value is accepted.
pub const PLACEHOLDER_SERIAL: [u8; 1] = [0x01];

/// Body part id of the single tagged certification request.
const REQUEST_BODY_PART_ID: u32 = 0;

/// Encoder turning CRMF requests into CMC `ContentInfo` structures.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmcEncoder;

impl CmcEncoder {
    /// Creates a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encodes a base64 CRMF request into a base64 CMS/CMC request.
    ///
    /// The output is deterministic: identical inputs produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`CmcError`](crate::CmcError) when the CRMF input cannot be
    /// decoded, lacks a subject or public key, or when encoding fails.
    #[tracing::instrument(skip(self, crmf_b64), fields(request_len = crmf_b64.len()))]
    pub fn encode(&self, crmf_b64: &str, ca_name: &str, template: &TemplateExtension) -> Result<String> {
        let der = self.encode_der(crmf_b64, ca_name, template)?;
        Ok(STANDARD.encode(der))
    }

    /// Same as [`encode`](Self::encode) but returns raw DER bytes.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_der(&self, crmf_b64: &str, ca_name: &str, template: &TemplateExtension) -> Result<Vec<u8>> {
        let message = crmf::decode_base64_request(crmf_b64)?;
        let requested = message.requested_certificate()?;

        let request = self.certification_request(&requested, template)?;
        let pki_data = PkiData::single_request(TaggedRequest::Tcr(TaggedCertificationRequest {
            body_part_id: REQUEST_BODY_PART_ID,
            certification_request: request,
        }));
        let pki_der = pki_data.to_der().context("PKIData")?;

        let content_info = self.signed_envelope(&pki_der, ca_name)?;
        let der = content_info.to_der().context("ContentInfo")?;
        tracing::debug!(ca = ca_name, pki_data_len = pki_der.len(), cms_len = der.len(), "encoded CMC request");
        Ok(der)
    }

    /// Builds the null-signed PKCS#10 request for the requested certificate.
    ///
    /// The `extensionRequest` attribute holds the template extension first,
    /// followed by any extensions requested in the CRMF template.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError::Der`](crate::CmcError::Der) if encoding fails.
    pub fn certification_request(
        &self,
        requested: &RequestedCertificate,
        template: &TemplateExtension,
    ) -> Result<CertReq> {
        let mut extensions: Extensions = Vec::with_capacity(requested.extensions.len() + 1);
        extensions.push(template.to_extension()?);
        extensions.extend(requested.extensions.iter().cloned());

        let extension_request = Attribute {
            oid: oid::EXTENSION_REQUEST,
            values: SetOfVec::try_from(vec![Any::encode_from(&extensions).context("Extensions")?])
                .context("extensionRequest values")?,
        };

        let info = CertReqInfo {
            version: Version::V1,
            subject: requested.subject.clone(),
            public_key: requested.public_key.clone(),
            attributes: SetOfVec::try_from(vec![extension_request]).context("attributes")?,
        };
        let info_der = info.to_der().context("CertificationRequestInfo")?;

        Ok(CertReq {
            info,
            algorithm: sha256_identifier()?,
            signature: BitString::from_bytes(&Sha256::digest(&info_der))
                .context("CertificationRequest signature")?,
        })
    }

    /// Wraps DER-encoded `PKIData` into a `ContentInfo` of type `signedData`.
    ///
    /// # Errors
    ///
    /// Returns [`CmcError::Der`](crate::CmcError::Der) if encoding fails.
    pub fn signed_envelope(&self, pki_der: &[u8], ca_name: &str) -> Result<ContentInfo> {
        let signed_attrs = SetOfVec::try_from(vec![
            Attribute {
                oid: oid::CONTENT_TYPE,
                values: SetOfVec::try_from(vec![Any::encode_from(&oid::PKI_DATA).context("contentType")?])
                    .context("contentType values")?,
            },
            Attribute {
                oid: oid::MESSAGE_DIGEST,
                values: SetOfVec::try_from(vec![
                    Any::new(Tag::OctetString, Sha256::digest(pki_der).to_vec()).context("messageDigest")?,
                ])
                .context("messageDigest values")?,
            },
        ])
        .context("signed attributes")?;
        let signed_attrs_der = signed_attrs.to_der().context("signed attributes")?;

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: common_name(ca_name)?,
                serial_number: SerialNumber::new(&PLACEHOLDER_SERIAL).context("serial number")?,
            }),
            digest_alg: sha256_identifier()?,
            signed_attrs: Some(signed_attrs),
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: oid::NO_SIGNATURE,
                parameters: Some(null_parameters()?),
            },
            signature: OctetString::new(Sha256::digest(&signed_attrs_der).to_vec()).context("signature")?,
            unsigned_attrs: None,
        };

        let signed_data = SignedData {
            version: CmsVersion::V3,
            digest_algorithms: SetOfVec::try_from(vec![sha256_identifier()?]).context("digestAlgorithms")?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: oid::PKI_DATA,
                econtent: Some(Any::new(Tag::OctetString, pki_der.to_vec()).context("eContent")?),
            },
            certificates: None,
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).context("signerInfos")?),
        };

        Ok(ContentInfo {
            content_type: oid::SIGNED_DATA,
            content: Any::encode_from(&signed_data).context("SignedData")?,
        })
    }
}

fn null_parameters() -> Result<Any> {
    Any::new(Tag::Null, Vec::<u8>::new()).context("NULL parameters")
}

fn sha256_identifier() -> Result<AlgorithmIdentifierOwned> {
    Ok(AlgorithmIdentifierOwned { oid: oid::SHA_256, parameters: Some(null_parameters()?) })
}

/// `CN=<common_name>` as a single-RDN distinguished name.
fn common_name(common_name: &str) -> Result<Name> {
    let atv = AttributeTypeAndValue {
        oid: oid::COMMON_NAME,
        value: Any::new(Tag::Utf8String, common_name.as_bytes()).context("commonName")?,
    };
    let rdn = RelativeDistinguishedName(SetOfVec::try_from(vec![atv]).context("RDN")?);
    Ok(RdnSequence(vec![rdn]))
}
