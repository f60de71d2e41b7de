//! WinRM message encryption over plain HTTP (MS-WSMV 2.2.9.1).
//!
//! After an NTLM handshake on an `http` endpoint every SOAP envelope travels
//! sealed inside a two-part `multipart/encrypted` body: a header part naming
//! the original length and an octet-stream part holding the signature length,
//! the signature and the sealed envelope.

use crate::{
    error::{RemotingError, Result},
    ntlm::SessionSecurity,
};

const BOUNDARY: &str = "Encrypted Boundary";
const PROTOCOL: &str = "application/HTTP-SPNEGO-session-encrypted";
const OCTET_STREAM_HEADER: &[u8] = b"\tContent-Type: application/octet-stream\r\n";
const LENGTH_MARKER: &[u8] = b"Length=";

/// `Content-Type` of a sealed request.
pub(crate) fn content_type() -> String {
    format!(r#"multipart/encrypted;protocol="{PROTOCOL}";boundary="{BOUNDARY}""#)
}

/// Whether a response `Content-Type` announces a sealed body.
pub(crate) fn is_encrypted(content_type: &str) -> bool {
    content_type.trim_start().to_ascii_lowercase().starts_with("multipart/encrypted")
}

/// Seals `envelope` into a multipart body.
pub(crate) fn seal_body(security: &mut SessionSecurity, envelope: &str) -> Result<Vec<u8>> {
    let (signature, sealed) = security.seal(envelope.as_bytes())?;

    let mut body = Vec::with_capacity(sealed.len() + 256);
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\n\tContent-Type: {PROTOCOL}\r\n\tOriginalContent: type=application/soap+xml;charset=UTF-8;Length={}\r\n--{BOUNDARY}\r\n",
            envelope.len()
        )
        .as_bytes(),
    );
    body.extend_from_slice(OCTET_STREAM_HEADER);
    body.extend_from_slice(&(signature.len() as u32).to_le_bytes());
    body.extend_from_slice(&signature);
    body.extend_from_slice(&sealed);
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

/// Unseals a multipart body produced by the peer.
pub(crate) fn unseal_body(security: &mut SessionSecurity, body: &[u8]) -> Result<String> {
    let malformed = |what: &str| RemotingError::transport_failure(format!("malformed encrypted reply: {what}"));

    let payload_start = find(body, OCTET_STREAM_HEADER).ok_or_else(|| malformed("no octet-stream part"))?;
    let length = original_length(&body[..payload_start]).ok_or_else(|| malformed("no original length"))?;
    let payload_start = payload_start + OCTET_STREAM_HEADER.len();

    let closing = format!("--{BOUNDARY}--");
    let payload_end = rfind(&body[payload_start..], closing.as_bytes())
        .map_or(body.len(), |end| payload_start + end);
    let payload = &body[payload_start..payload_end];

    let signature_len = payload
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(|bytes| u32::from_le_bytes(bytes) as usize)
        .ok_or_else(|| malformed("truncated signature"))?;
    let signature = payload.get(4..4 + signature_len).ok_or_else(|| malformed("truncated signature"))?;
    let message = security.unseal(signature, &payload[4 + signature_len..])?;

    if message.len() != length {
        return Err(malformed("length mismatch"));
    }
    String::from_utf8(message).map_err(|e| RemotingError::transport_failure_with_source("encrypted reply is not UTF-8", e))
}

fn original_length(headers: &[u8]) -> Option<usize> {
    let start = find(headers, LENGTH_MARKER)? + LENGTH_MARKER.len();
    let digits: Vec<u8> = headers[start..].iter().copied().take_while(u8::is_ascii_digit).collect();
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [0x42; 16];

    #[test]
    fn test_sealed_body_round_trips() {
        let mut client = SessionSecurity::client(&KEY).unwrap();
        let mut server = SessionSecurity::server(&KEY).unwrap();
        let envelope = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body/></s:Envelope>"#;

        let body = seal_body(&mut client, envelope).unwrap();
        assert!(body.starts_with(b"--Encrypted Boundary\r\n\tContent-Type: application/HTTP-SPNEGO-session-encrypted\r\n"));
        assert!(find(&body, format!("Length={}\r\n", envelope.len()).as_bytes()).is_some());
        assert!(body.ends_with(b"--Encrypted Boundary--\r\n"));
        assert!(find(&body, envelope.as_bytes()).is_none());

        assert_eq!(unseal_body(&mut server, &body).unwrap(), envelope);
    }

    #[test]
    fn test_replies_decrypt_in_sequence() {
        let mut client = SessionSecurity::client(&KEY).unwrap();
        let mut server = SessionSecurity::server(&KEY).unwrap();

        for reply in ["<rsp:ShellId>S1</rsp:ShellId>", "<rsp:CommandId>C1</rsp:CommandId>"] {
            let body = seal_body(&mut server, reply).unwrap();
            assert_eq!(unseal_body(&mut client, &body).unwrap(), reply);
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut client = SessionSecurity::client(&KEY).unwrap();
        let mut server = SessionSecurity::server(&KEY).unwrap();
        let mut body = seal_body(&mut server, "<s:Body/>").unwrap();
        let at = find(&body, b"Length=9").unwrap() + LENGTH_MARKER.len();
        body[at] = b'8';
        assert!(unseal_body(&mut client, &body).is_err());
    }

    #[test]
    fn test_plain_body_rejected() {
        let mut client = SessionSecurity::client(&KEY).unwrap();
        assert!(unseal_body(&mut client, b"<s:Envelope/>").is_err());
    }

    #[test]
    fn test_content_type() {
        assert!(is_encrypted(&content_type()));
        assert!(is_encrypted("Multipart/Encrypted;protocol=\"x\""));
        assert!(!is_encrypted("application/soap+xml;charset=UTF-8"));
    }
}
