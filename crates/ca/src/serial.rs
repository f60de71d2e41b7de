//! Certificate decoding helpers.

use std::fmt::Write as _;

use base64::{Engine, engine::general_purpose::STANDARD};
use der::Decode;
use x509_cert::Certificate;

use crate::error::{CaError, Result};

/// Strips PEM armour and whitespace from a base64 certificate or request.
#[must_use]
pub fn normalize_base64(input: &str) -> String {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !(line.starts_with("-----BEGIN") || line.starts_with("-----END")))
        .flat_map(str::chars)
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Decodes a base64 (optionally PEM) DER certificate.
///
/// # Errors
///
/// Returns [`CaError::Certificate`] if the input is not base64 or not a
/// DER certificate.
pub fn decode_certificate(certificate_b64: &str) -> Result<Certificate> {
    let der = STANDARD
        .decode(normalize_base64(certificate_b64))
        .map_err(|e| CaError::certificate_with_source("certificate is not valid base64", e))?;
    Certificate::from_der(&der).map_err(|e| CaError::certificate_with_source("certificate is not valid DER", e))
}

/// Serial number of a base64 DER certificate, as lower-case hex without
/// leading zeros. This is the form the CA database is queried with.
///
/// # Errors
///
/// See [`decode_certificate`].
pub fn certificate_serial(certificate_b64: &str) -> Result<String> {
    let certificate = decode_certificate(certificate_b64)?;
    Ok(serial_hex(certificate.tbs_certificate.serial_number.as_bytes()))
}

fn serial_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    match hex.trim_start_matches('0') {
        "" => "0".to_owned(),
        trimmed => trimmed.to_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    /// Ed25519 self-signed, serial `8f3a00c4d2e1b7a95f0c` (DER carries a
    /// leading zero byte).
    const LEAF: &str = "MIHqMIGdoAMCAQICCwCPOgDE0uG3qV8MMAUGAytlcDAaMRgwFgYDVQQDDA9UZXN0IElzc3VpbmcgQ0EwHhcNMjUwMTAxMDAwMDAwWhcNMzUwMTAxMDAwMDAwWjAaMRgwFgYDVQQDDA9sZWFmLnRlc3QubG9jYWwwKjAFBgMrZXADIQC8WdGE6VyCtXN9Y5x7j/FW61jWUzLilxlAfq0IVaW6KDAFBgMrZXADQQDGiFIkCt1AatRKnOIDsjyn73GjnyXnHQyuyPfmu8fIsD8pERfqG5Qlsari100Rs+xqqhBMIcQZrQvySTW6kgUP";

    /// Serial `0a1b`.
    const SMALL: &str = "MIHiMIGVoAMCAQICAgobMAUGAytlcDAaMRgwFgYDVQQDDA9UZXN0IElzc3VpbmcgQ0EwHhcNMjUwMTAxMDAwMDAwWhcNMzUwMTAxMDAwMDAwWjAbMRkwFwYDVQQDDBBzbWFsbC50ZXN0LmxvY2FsMCowBQYDK2VwAyEAKQ0L6YxI83hvz3hp4ubxjz/lMlnIsuXpXw3rjECId18wBQYDK2VwA0EALJTGBryue6aUJGoILZuFzu7mvSMC0KoDBrcrGv1OsN12dc5Qiwpq32u/0BQ7UkvMx8lLQiOQUOwOq1rkjKbwAQ==";

    #[test]
    fn test_serial_strips_sign_byte() {
        assert_eq!(certificate_serial(LEAF).unwrap(), "8f3a00c4d2e1b7a95f0c");
    }

    #[test]
    fn test_serial_strips_leading_zero_nibble() {
        assert_eq!(certificate_serial(SMALL).unwrap(), "a1b");
    }

    #[test]
    fn test_pem_input_accepted() {
        let body: Vec<&str> = LEAF.as_bytes().chunks(64).map(|c| std::str::from_utf8(c).unwrap()).collect();
        let pem = format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n", body.join("\n"));
        assert_eq!(certificate_serial(&pem).unwrap(), "8f3a00c4d2e1b7a95f0c");
    }

    #[test]
    fn test_garbage_is_certificate_error() {
        assert!(matches!(certificate_serial("not base64!"), Err(CaError::Certificate { .. })));
        assert!(matches!(certificate_serial("AAAA"), Err(CaError::Certificate { .. })));
    }

    #[test]
    fn test_serial_hex_zero() {
        assert_eq!(serial_hex(&[0x00]), "0");
    }
}
