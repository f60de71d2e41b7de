//! CMC `PKIData` (RFC 5272 section 3.2.1).
//!
//! ```text
//! PKIData ::= SEQUENCE {
//!     controlSequence    SEQUENCE SIZE(0..MAX) OF TaggedAttribute,
//!     reqSequence        SEQUENCE SIZE(0..MAX) OF TaggedRequest,
//!     cmsSequence        SEQUENCE SIZE(0..MAX) OF TaggedContentInfo,
//!     otherMsgSequence   SEQUENCE SIZE(0..MAX) OF OtherMsg
//! }
//! ```
//!
//! All four sequences are always encoded, even when empty.

use der::{
    Any, Choice, Sequence,
    asn1::{ObjectIdentifier, SetOfVec},
};
use x509_cert::request::CertReq;

use crate::crmf::CertReqMsg;

/// `BodyPartID ::= INTEGER(0..4294967295)`
pub type BodyPartId = u32;

/// The PKI data carried inside the CMC signed envelope.
#[derive(Clone, Debug, Default, Eq, PartialEq, Sequence)]
pub struct PkiData {
    pub control_sequence: Vec<TaggedAttribute>,
    pub req_sequence: Vec<TaggedRequest>,
    pub cms_sequence: Vec<TaggedContentInfo>,
    pub other_msg_sequence: Vec<OtherMsg>,
}

impl PkiData {
    /// A `PKIData` carrying a single tagged request and nothing else.
    #[must_use]
    pub fn single_request(request: TaggedRequest) -> Self {
        Self { req_sequence: vec![request], ..Self::default() }
    }
}

/// `TaggedAttribute`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TaggedAttribute {
    pub body_part_id: BodyPartId,
    pub attr_type: ObjectIdentifier,
    pub attr_values: SetOfVec<Any>,
}

/// `TaggedRequest`
#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum TaggedRequest {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT", constructed = "true")]
    Tcr(TaggedCertificationRequest),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", constructed = "true")]
    Crm(CertReqMsg),
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT", constructed = "true")]
    Orm(OtherRequestMessage),
}

/// `TaggedCertificationRequest`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TaggedCertificationRequest {
    pub body_part_id: BodyPartId,
    pub certification_request: CertReq,
}

/// The `orm` alternative of `TaggedRequest`.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OtherRequestMessage {
    pub body_part_id: BodyPartId,
    pub request_message_type: ObjectIdentifier,
    pub request_message_value: Any,
}

/// `TaggedContentInfo`; the nested `ContentInfo` is kept undecoded.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TaggedContentInfo {
    pub body_part_id: BodyPartId,
    pub content_info: Any,
}

/// `OtherMsg`
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OtherMsg {
    pub body_part_id: BodyPartId,
    pub other_msg_type: ObjectIdentifier,
    pub other_msg_value: Any,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use der::{Decode, Encode};

    use super::*;

    #[test]
    fn test_empty_pki_data_encodes_all_sequences() {
        let der = PkiData::default().to_der().unwrap();
        assert_eq!(der, [0x30, 0x08, 0x30, 0x00, 0x30, 0x00, 0x30, 0x00, 0x30, 0x00]);
    }

    #[test]
    fn test_orm_request_uses_context_tag_two() {
        let orm = TaggedRequest::Orm(OtherRequestMessage {
            body_part_id: 7,
            request_message_type: ObjectIdentifier::new_unwrap("1.2.3.4"),
            request_message_value: Any::new(der::Tag::Null, Vec::<u8>::new()).unwrap(),
        });
        let data = PkiData::single_request(orm.clone());
        let der = data.to_der().unwrap();

        // SEQUENCE { SEQUENCE {}, SEQUENCE { [2] ... } ... }
        assert_eq!(der[4], 0x30);
        assert_eq!(der[6], 0xA2);

        let decoded = PkiData::from_der(&der).unwrap();
        assert_eq!(decoded.req_sequence, vec![orm]);
    }
}
