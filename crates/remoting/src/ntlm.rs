//! NTLMv2 authentication and session security (MS-NLMP).
//!
//! WinRM answers an HTTP `Negotiate` challenge with raw NTLMSSP tokens when
//! Kerberos is unavailable. [`NtlmClient`] produces the NEGOTIATE and
//! AUTHENTICATE messages; the resulting [`SessionSecurity`] signs and seals
//! the SOAP messages that follow on the same connection.
//!
//! Only extended session security with key exchange and 128-bit keys is
//! supported, which every WinRM host since Windows 7 grants.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md4::Md4;
use md5::{Digest, Md5};
use rc4::{KeyInit, Rc4, StreamCipher, consts::U16};
use zeroize::Zeroizing;

use crate::{
    credentials::Credentials,
    error::{RemotingError, Result},
};

type HmacMd5 = Hmac<Md5>;
type SealCipher = Rc4<U16>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_SIGN: u32 = 0x0000_0010;
const NEGOTIATE_SEAL: u32 = 0x0000_0020;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_VERSION: u32 = 0x0200_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_KEY_EXCH: u32 = 0x4000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_SIGN
    | NEGOTIATE_SEAL
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSION_SECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_VERSION
    | NEGOTIATE_128
    | NEGOTIATE_KEY_EXCH
    | NEGOTIATE_56;

const REQUIRED_FLAGS: u32 =
    NEGOTIATE_SIGN | NEGOTIATE_SEAL | NEGOTIATE_EXTENDED_SESSION_SECURITY | NEGOTIATE_128 | NEGOTIATE_KEY_EXCH;

/// Windows 10.0 build 17763, NTLM revision 15.
const VERSION: [u8; 8] = [10, 0, 0x63, 0x45, 0, 0, 0, 0x0f];

const NEGOTIATE_LEN: u32 = 40;
const AUTHENTICATE_HEADER_LEN: u32 = 88;
const MIC_OFFSET: usize = 72;

const AV_EOL: u16 = 0;
const AV_FLAGS: u16 = 6;
const AV_TIMESTAMP: u16 = 7;
const AV_CHANNEL_BINDINGS: u16 = 10;
const AV_FLAG_MIC: u32 = 0x0000_0002;

const CLIENT_SIGNING: &[u8] = b"session key to client-to-server signing key magic constant\0";
const SERVER_SIGNING: &[u8] = b"session key to server-to-client signing key magic constant\0";
const CLIENT_SEALING: &[u8] = b"session key to client-to-server sealing key magic constant\0";
const SERVER_SEALING: &[u8] = b"session key to server-to-client sealing key magic constant\0";

/// 1601-01-01 to 1970-01-01 in 100 ns ticks.
const UNIX_EPOCH_FILETIME: u64 = 116_444_736_000_000_000;

/// Client side of one NTLM handshake.
pub(crate) struct NtlmClient {
    user: String,
    domain: String,
    password: Zeroizing<String>,
    negotiate: Vec<u8>,
}

impl std::fmt::Debug for NtlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmClient").field("user", &self.user).field("domain", &self.domain).finish_non_exhaustive()
    }
}

impl NtlmClient {
    /// `DOMAIN\user` is split into its parts; `user@domain` is sent as the
    /// user name with an empty domain.
    pub fn new(credentials: &Credentials) -> Self {
        let (domain, user) = match credentials.username().split_once('\\') {
            Some((domain, user)) => (domain.to_owned(), user.to_owned()),
            None => (String::new(), credentials.username().to_owned()),
        };
        Self { user, domain, password: Zeroizing::new(credentials.secret().to_owned()), negotiate: negotiate_message() }
    }

    /// The NEGOTIATE message opening the handshake.
    pub fn negotiate(&self) -> &[u8] {
        &self.negotiate
    }

    /// Answers the server CHALLENGE with an AUTHENTICATE message.
    pub fn authenticate(&self, challenge: &[u8]) -> Result<(Vec<u8>, SessionSecurity)> {
        self.authenticate_with(challenge, rand::random(), rand::random(), filetime_now())
    }

    fn authenticate_with(
        &self,
        challenge_message: &[u8],
        client_challenge: [u8; 8],
        exported_key: [u8; 16],
        now: u64,
    ) -> Result<(Vec<u8>, SessionSecurity)> {
        let challenge = Challenge::parse(challenge_message)?;
        if challenge.flags & REQUIRED_FLAGS != REQUIRED_FLAGS {
            return Err(RemotingError::connection(format!(
                "server did not grant NTLMv2 session security (flags {:#010x})",
                challenge.flags
            )));
        }

        let pairs = av_pairs(&challenge.target_info)?;
        let timestamp = pairs.iter().find(|(id, _)| *id == AV_TIMESTAMP).and_then(|(_, value)| read_u64(value, 0));
        let target_info = authenticate_target_info(&pairs, timestamp.is_some());

        let response_key = ntowf_v2(&self.password, &self.user, &self.domain)?;
        let (nt_response, nt_proof) = ntlmv2_response(
            &response_key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp.unwrap_or(now),
            &target_info,
        )?;
        let lm_response = if timestamp.is_some() {
            vec![0; 24]
        } else {
            lmv2_response(&response_key, &challenge.server_challenge, &client_challenge)?
        };

        let session_base_key = hmac_md5(&response_key, &[&nt_proof])?;
        let mut encrypted_key = exported_key;
        seal_cipher(&session_base_key)?.apply_keystream(&mut encrypted_key);

        let mut message = authenticate_message(
            challenge.flags & CLIENT_FLAGS,
            [&lm_response, &nt_response, &utf16le(&self.domain), &utf16le(&self.user), &[], &encrypted_key],
        );
        if timestamp.is_some() {
            let mic = hmac_md5(&exported_key, &[&self.negotiate, challenge_message, &message])?;
            message[MIC_OFFSET..MIC_OFFSET + 16].copy_from_slice(&mic);
        }

        Ok((message, SessionSecurity::client(&exported_key)?))
    }
}

struct Challenge {
    flags: u32,
    server_challenge: [u8; 8],
    target_info: Vec<u8>,
}

impl Challenge {
    fn parse(message: &[u8]) -> Result<Self> {
        let malformed = || RemotingError::connection("malformed NTLM challenge");
        if message.get(..8) != Some(SIGNATURE.as_slice()) || read_u32(message, 8) != Some(2) {
            return Err(malformed());
        }
        let flags = read_u32(message, 20).ok_or_else(malformed)?;
        let server_challenge: [u8; 8] =
            message.get(24..32).and_then(|bytes| bytes.try_into().ok()).ok_or_else(malformed)?;
        let info_len = usize::from(read_u16(message, 40).ok_or_else(malformed)?);
        let info_offset = read_u32(message, 44).ok_or_else(malformed)? as usize;
        let target_info = if info_len == 0 {
            Vec::new()
        } else {
            message.get(info_offset..info_offset + info_len).ok_or_else(malformed)?.to_vec()
        };
        Ok(Self { flags, server_challenge, target_info })
    }
}

/// Signing and sealing state of an authenticated connection.
pub(crate) struct SessionSecurity {
    sign_out: [u8; 16],
    sign_in: [u8; 16],
    seal_out: SealCipher,
    seal_in: SealCipher,
    seq_out: u32,
    seq_in: u32,
}

impl std::fmt::Debug for SessionSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecurity")
            .field("seq_out", &self.seq_out)
            .field("seq_in", &self.seq_in)
            .finish_non_exhaustive()
    }
}

impl SessionSecurity {
    pub(crate) fn client(exported_key: &[u8; 16]) -> Result<Self> {
        Self::with_keys(exported_key, (CLIENT_SIGNING, CLIENT_SEALING), (SERVER_SIGNING, SERVER_SEALING))
    }

    /// The peer's view of the same context.
    #[cfg(test)]
    pub(crate) fn server(exported_key: &[u8; 16]) -> Result<Self> {
        Self::with_keys(exported_key, (SERVER_SIGNING, SERVER_SEALING), (CLIENT_SIGNING, CLIENT_SEALING))
    }

    fn with_keys(key: &[u8; 16], outbound: (&[u8], &[u8]), inbound: (&[u8], &[u8])) -> Result<Self> {
        Ok(Self {
            sign_out: md5(&[key, outbound.0]),
            sign_in: md5(&[key, inbound.0]),
            seal_out: seal_cipher(&md5(&[key, outbound.1]))?,
            seal_in: seal_cipher(&md5(&[key, inbound.1]))?,
            seq_out: 0,
            seq_in: 0,
        })
    }

    /// Encrypts an outgoing message and returns its 16-byte signature with
    /// the sealed bytes.
    pub fn seal(&mut self, message: &[u8]) -> Result<([u8; 16], Vec<u8>)> {
        let mut sealed = message.to_vec();
        self.seal_out.apply_keystream(&mut sealed);
        let signature = mac_signature(&self.sign_out, &mut self.seal_out, self.seq_out, message)?;
        self.seq_out = self.seq_out.wrapping_add(1);
        Ok((signature, sealed))
    }

    /// Decrypts an incoming message and verifies its signature.
    pub fn unseal(&mut self, signature: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        let mut message = sealed.to_vec();
        self.seal_in.apply_keystream(&mut message);
        let expected = mac_signature(&self.sign_in, &mut self.seal_in, self.seq_in, &message)?;
        self.seq_in = self.seq_in.wrapping_add(1);
        if signature != expected.as_slice() {
            return Err(RemotingError::transport_failure("NTLM message signature mismatch"));
        }
        Ok(message)
    }
}

fn mac_signature(sign_key: &[u8; 16], seal: &mut SealCipher, seq: u32, message: &[u8]) -> Result<[u8; 16]> {
    let mac = hmac_md5(sign_key, &[&seq.to_le_bytes(), message])?;
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&mac[..8]);
    seal.apply_keystream(&mut checksum);

    let mut signature = [0u8; 16];
    signature[..4].copy_from_slice(&1u32.to_le_bytes());
    signature[4..12].copy_from_slice(&checksum);
    signature[12..].copy_from_slice(&seq.to_le_bytes());
    Ok(signature)
}

fn negotiate_message() -> Vec<u8> {
    let mut message = Vec::with_capacity(NEGOTIATE_LEN as usize);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&1u32.to_le_bytes());
    message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
    push_field(&mut message, 0, NEGOTIATE_LEN);
    push_field(&mut message, 0, NEGOTIATE_LEN);
    message.extend_from_slice(&VERSION);
    message
}

/// Fields in header order: LM response, NT response, domain, user,
/// workstation, encrypted session key. The MIC is left zeroed.
fn authenticate_message(flags: u32, fields: [&[u8]; 6]) -> Vec<u8> {
    let payload_len: usize = fields.iter().map(|field| field.len()).sum();
    let mut message = Vec::with_capacity(AUTHENTICATE_HEADER_LEN as usize + payload_len);
    message.extend_from_slice(SIGNATURE);
    message.extend_from_slice(&3u32.to_le_bytes());

    let mut offset = AUTHENTICATE_HEADER_LEN;
    for field in fields {
        push_field(&mut message, field.len(), offset);
        offset += field.len() as u32;
    }
    message.extend_from_slice(&(flags | NEGOTIATE_VERSION).to_le_bytes());
    message.extend_from_slice(&VERSION);
    message.extend_from_slice(&[0; 16]);
    for field in fields {
        message.extend_from_slice(field);
    }
    message
}

fn push_field(message: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&offset.to_le_bytes());
}

fn av_pairs(target_info: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    let malformed = || RemotingError::connection("malformed NTLM target information");
    let mut pairs = Vec::new();
    let mut at = 0;
    while at < target_info.len() {
        let id = read_u16(target_info, at).ok_or_else(malformed)?;
        let len = usize::from(read_u16(target_info, at + 2).ok_or_else(malformed)?);
        if id == AV_EOL {
            break;
        }
        let value = target_info.get(at + 4..at + 4 + len).ok_or_else(malformed)?;
        pairs.push((id, value));
        at += 4 + len;
    }
    Ok(pairs)
}

/// Server pairs plus the MIC flag when a MIC is sent and empty channel
/// bindings, terminated by `MsvAvEOL`.
fn authenticate_target_info(pairs: &[(u16, &[u8])], with_mic: bool) -> Vec<u8> {
    let mut info = Vec::new();
    let mut flags = if with_mic { AV_FLAG_MIC } else { 0 };
    for &(id, value) in pairs {
        match id {
            AV_FLAGS => flags |= read_u32(value, 0).unwrap_or_default(),
            AV_CHANNEL_BINDINGS => {},
            _ => push_av(&mut info, id, value),
        }
    }
    if flags != 0 {
        push_av(&mut info, AV_FLAGS, &flags.to_le_bytes());
    }
    push_av(&mut info, AV_CHANNEL_BINDINGS, &[0; 16]);
    push_av(&mut info, AV_EOL, &[]);
    info
}

fn push_av(info: &mut Vec<u8>, id: u16, value: &[u8]) {
    info.extend_from_slice(&id.to_le_bytes());
    info.extend_from_slice(&(value.len() as u16).to_le_bytes());
    info.extend_from_slice(value);
}

fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16]> {
    let password = Zeroizing::new(utf16le(password));
    let nt_hash = Zeroizing::new(digest16(&Md4::digest(password.as_slice())));
    hmac_md5(nt_hash.as_slice(), &[&utf16le(&format!("{}{domain}", user.to_uppercase()))])
}

fn ntlmv2_response(
    response_key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    time: u64,
    target_info: &[u8],
) -> Result<(Vec<u8>, [u8; 16])> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&time.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(response_key, &[server_challenge, &blob])?;
    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    Ok((response, proof))
}

fn lmv2_response(response_key: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Result<Vec<u8>> {
    let mut response = hmac_md5(response_key, &[server_challenge, client_challenge])?.to_vec();
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key)
        .map_err(|e| RemotingError::connection_with_source("invalid NTLM key", e))?;
    for part in parts {
        mac.update(part);
    }
    Ok(digest16(&mac.finalize().into_bytes()))
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    digest16(&hasher.finalize())
}

fn seal_cipher(key: &[u8; 16]) -> Result<SealCipher> {
    <SealCipher as KeyInit>::new_from_slice(key).map_err(|e| RemotingError::connection_with_source("invalid RC4 key", e))
}

fn digest16(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[..16]);
    out
}

fn utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.get(at..at + 8)?.try_into().ok()?))
}

fn filetime_now() -> u64 {
    let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    UNIX_EPOCH_FILETIME + (since_epoch.as_nanos() / 100) as u64
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::credentials::AuthScheme;

    // Values from the NTLMv2 authentication example of MS-NLMP 4.2.4.
    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];
    const EXPORTED_KEY: [u8; 16] = [0x55; 16];

    fn example_target_info() -> Vec<u8> {
        let mut info = Vec::new();
        push_av(&mut info, 2, &utf16le("Domain"));
        push_av(&mut info, 1, &utf16le("Server"));
        push_av(&mut info, AV_EOL, &[]);
        info
    }

    fn challenge_message(flags: u32, target_info: &[u8]) -> Vec<u8> {
        acceptor::challenge(flags, SERVER_CHALLENGE, target_info)
    }

    fn field(message: &[u8], at: usize) -> &[u8] {
        let len = usize::from(read_u16(message, at).unwrap());
        let offset = read_u32(message, at + 4).unwrap() as usize;
        &message[offset..offset + len]
    }

    fn client(username: &str) -> NtlmClient {
        NtlmClient::new(&Credentials::new(username, "Password", AuthScheme::Ntlm))
    }

    #[test]
    fn test_ntlmv2_known_answers() {
        let response_key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(
            response_key,
            [0x0c, 0x86, 0x8a, 0x40, 0x3b, 0xfd, 0x7a, 0x93, 0xa3, 0x00, 0x1e, 0xf2, 0x2e, 0xf0, 0x2e, 0x3f]
        );

        let (response, proof) =
            ntlmv2_response(&response_key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE, 0, &example_target_info()).unwrap();
        assert_eq!(
            proof,
            [0x68, 0xcd, 0x0a, 0xb8, 0x51, 0xe5, 0x1c, 0x96, 0xaa, 0xbc, 0x92, 0x7b, 0xeb, 0xef, 0x6a, 0x1c]
        );
        assert_eq!(&response[..16], proof.as_slice());

        let session_base_key = hmac_md5(&response_key, &[&proof]).unwrap();
        assert_eq!(
            session_base_key,
            [0x8d, 0xe4, 0x0c, 0xca, 0xdb, 0xc1, 0x4a, 0x82, 0xf1, 0x5c, 0xb0, 0xad, 0x0d, 0xe9, 0x5c, 0xa3]
        );

        let mut encrypted_key = EXPORTED_KEY;
        seal_cipher(&session_base_key).unwrap().apply_keystream(&mut encrypted_key);
        assert_eq!(
            encrypted_key,
            [0xc5, 0xda, 0xd2, 0x54, 0x4f, 0xc9, 0x79, 0x90, 0x94, 0xce, 0x1c, 0xe9, 0x0b, 0xc9, 0xd0, 0x3e]
        );

        let lm = lmv2_response(&response_key, &SERVER_CHALLENGE, &CLIENT_CHALLENGE).unwrap();
        assert_eq!(
            lm[..16],
            [0x86, 0xc3, 0x50, 0x97, 0xac, 0x9c, 0xec, 0x10, 0x25, 0x54, 0x76, 0x4a, 0x57, 0xcc, 0xcc, 0x19]
        );
        assert_eq!(lm[16..], CLIENT_CHALLENGE);
    }

    #[test]
    fn test_seal_known_answer() {
        let mut security = SessionSecurity::client(&EXPORTED_KEY).unwrap();
        let (signature, sealed) = security.seal(&utf16le("Plaintext")).unwrap();
        assert_eq!(
            sealed,
            [0x54, 0xe5, 0x01, 0x65, 0xbf, 0x19, 0x36, 0xdc, 0x99, 0x60, 0x20, 0xc1, 0x81, 0x1b, 0x0f, 0x06, 0xfb, 0x5f]
        );
        assert_eq!(
            signature,
            [0x01, 0x00, 0x00, 0x00, 0x7f, 0xb3, 0x8e, 0xc5, 0xc5, 0x5d, 0x49, 0x76, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sealed_messages_round_trip_in_both_directions() {
        let mut client = SessionSecurity::client(&EXPORTED_KEY).unwrap();
        let mut server = SessionSecurity::server(&EXPORTED_KEY).unwrap();

        for text in ["first envelope", "second envelope", ""] {
            let (signature, sealed) = client.seal(text.as_bytes()).unwrap();
            assert_eq!(server.unseal(&signature, &sealed).unwrap(), text.as_bytes());

            let (signature, sealed) = server.seal(text.as_bytes()).unwrap();
            assert_eq!(client.unseal(&signature, &sealed).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn test_tampered_message_rejected() {
        let mut client = SessionSecurity::client(&EXPORTED_KEY).unwrap();
        let mut server = SessionSecurity::server(&EXPORTED_KEY).unwrap();
        let (signature, mut sealed) = client.seal(b"<s:Envelope/>").unwrap();
        sealed[0] ^= 0xff;
        let err = server.unseal(&signature, &sealed).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_negotiate_message_layout() {
        let message = negotiate_message();
        assert_eq!(message.len(), NEGOTIATE_LEN as usize);
        assert_eq!(&message[..8], SIGNATURE);
        assert_eq!(read_u32(&message, 8), Some(1));
        assert_eq!(read_u32(&message, 12), Some(CLIENT_FLAGS));
    }

    #[test]
    fn test_identity_split() {
        let ntlm = client(r"CORP\svc-adcs");
        assert_eq!((ntlm.domain.as_str(), ntlm.user.as_str()), ("CORP", "svc-adcs"));
        let ntlm = client("svc-adcs@corp.local");
        assert_eq!((ntlm.domain.as_str(), ntlm.user.as_str()), ("", "svc-adcs@corp.local"));
    }

    #[test]
    fn test_authenticate_without_timestamp() {
        let ntlm = client(r"Domain\User");
        let challenge = challenge_message(CLIENT_FLAGS, &example_target_info());
        let (message, _) = ntlm.authenticate_with(&challenge, CLIENT_CHALLENGE, EXPORTED_KEY, 0).unwrap();

        assert_eq!(&message[..8], SIGNATURE);
        assert_eq!(read_u32(&message, 8), Some(3));
        assert_eq!(field(&message, 12).len(), 24);
        assert_eq!(field(&message, 28), utf16le("Domain").as_slice());
        assert_eq!(field(&message, 36), utf16le("User").as_slice());
        assert_eq!(
            field(&message, 52),
            [0xc5, 0xda, 0xd2, 0x54, 0x4f, 0xc9, 0x79, 0x90, 0x94, 0xce, 0x1c, 0xe9, 0x0b, 0xc9, 0xd0, 0x3e]
        );
        assert_eq!(message[MIC_OFFSET..MIC_OFFSET + 16], [0; 16]);

        let nt_response = field(&message, 20);
        let blob = &nt_response[16..];
        assert_eq!(&blob[16..24], CLIENT_CHALLENGE.as_slice());
        let response_key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(nt_response[..16], hmac_md5(&response_key, &[&SERVER_CHALLENGE, blob]).unwrap());
    }

    #[test]
    fn test_authenticate_with_timestamp_sends_mic() {
        let timestamp = 0x01d9_0000_0000_0000u64;
        let mut info = Vec::new();
        push_av(&mut info, 2, &utf16le("CORP"));
        push_av(&mut info, AV_TIMESTAMP, &timestamp.to_le_bytes());
        push_av(&mut info, AV_EOL, &[]);

        let ntlm = client(r"CORP\svc");
        let challenge = challenge_message(CLIENT_FLAGS, &info);
        let (message, _) = ntlm.authenticate_with(&challenge, CLIENT_CHALLENGE, EXPORTED_KEY, 42).unwrap();

        assert_eq!(field(&message, 12), [0; 24]);
        let blob = &field(&message, 20)[16..];
        assert_eq!(read_u64(blob, 8), Some(timestamp));
        let pairs = av_pairs(&blob[28..]).unwrap();
        assert!(pairs.iter().any(|&(id, value)| id == AV_FLAGS && read_u32(value, 0) == Some(AV_FLAG_MIC)));
        assert!(pairs.iter().any(|&(id, value)| id == AV_CHANNEL_BINDINGS && value == [0; 16]));

        let mut zeroed = message.clone();
        zeroed[MIC_OFFSET..MIC_OFFSET + 16].fill(0);
        let mic = hmac_md5(&EXPORTED_KEY, &[ntlm.negotiate(), &challenge, &zeroed]).unwrap();
        assert_eq!(message[MIC_OFFSET..MIC_OFFSET + 16], mic);
    }

    #[test]
    fn test_acceptor_recovers_the_session_key() {
        let ntlm = client(r"CORP\svc");
        let challenge = challenge_message(CLIENT_FLAGS, &example_target_info());
        let (message, mut client_security) = ntlm.authenticate(&challenge).unwrap();

        let mut server_security = acceptor::accept(&message, &SERVER_CHALLENGE, "Password").unwrap();
        let (signature, sealed) = client_security.seal(b"<s:Envelope/>").unwrap();
        assert_eq!(server_security.unseal(&signature, &sealed).unwrap(), b"<s:Envelope/>");

        assert!(acceptor::accept(&message, &SERVER_CHALLENGE, "wrong").is_err());
    }

    #[test]
    fn test_weak_server_flags_rejected() {
        let challenge = challenge_message(NEGOTIATE_UNICODE | NEGOTIATE_NTLM, &example_target_info());
        let err = client("svc").authenticate(&challenge).unwrap_err();
        assert!(matches!(err, RemotingError::Connection { .. }));
    }

    #[test]
    fn test_malformed_challenge_rejected() {
        for message in [&b"NTLMSSP\0"[..], b"", &[0u8; 48]] {
            assert!(client("svc").authenticate(message).is_err());
        }
        let mut truncated = challenge_message(CLIENT_FLAGS, &example_target_info());
        truncated.truncate(60);
        assert!(client("svc").authenticate(&truncated).is_err());
    }
}
