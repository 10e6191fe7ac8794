//! NTLM messages for `AUTH NTLM` (MS-NLMP).
//!
//! Only NTLMv2 responses are produced. No session key is negotiated since
//! SMTP never signs or seals after authentication.

use chrono::Utc;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use crate::error::{Error, Result};

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
const NEGOTIATE_OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const BASE_FLAGS: u32 = NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: i64 = 11_644_473_600;

/// Credentials for one NTLM exchange.
#[derive(Clone, Copy)]
pub struct NtlmCredentials<'a> {
    /// Windows domain; may be empty.
    pub domain: &'a str,
    /// Client workstation name; may be empty.
    pub workstation: &'a str,
    /// Account name.
    pub user: &'a str,
    /// Account password.
    pub password: &'a str,
}

impl std::fmt::Debug for NtlmCredentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Server challenge (type 2 message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Negotiated flags.
    pub flags: u32,
    /// Eight-byte server nonce.
    pub server_challenge: [u8; 8],
    /// Raw AV pair list echoed back in the NTLMv2 response.
    pub target_info: Vec<u8>,
}

impl Challenge {
    /// Parses a decoded type 2 message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the message is truncated or is not a
    /// challenge.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        let malformed = || Error::Protocol("Malformed NTLM challenge".into());

        if msg.get(..8) != Some(&SIGNATURE[..]) {
            return Err(malformed());
        }
        if read_u32(msg, 8).ok_or_else(malformed)? != 2 {
            return Err(malformed());
        }

        let flags = read_u32(msg, 20).ok_or_else(malformed)?;
        let server_challenge: [u8; 8] = msg
            .get(24..32)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(malformed)?;
        let target_info = if msg.len() >= 48 {
            read_buffer(msg, 40).ok_or_else(malformed)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    const fn is_unicode(&self) -> bool {
        self.flags & NEGOTIATE_UNICODE != 0
    }
}

/// Builds the type 1 message announcing the client.
///
/// # Errors
///
/// Returns [`Error::InvalidUsage`] if a name does not fit a message field.
pub fn negotiate_message(domain: &str, workstation: &str) -> Result<Vec<u8>> {
    let domain = domain.to_ascii_uppercase();
    let workstation = workstation.to_ascii_uppercase();

    let mut flags = BASE_FLAGS | NEGOTIATE_UNICODE | NEGOTIATE_OEM | REQUEST_TARGET;
    if !domain.is_empty() {
        flags |= NEGOTIATE_OEM_DOMAIN_SUPPLIED;
    }
    if !workstation.is_empty() {
        flags |= NEGOTIATE_OEM_WORKSTATION_SUPPLIED;
    }

    let mut writer = MessageWriter::new(1, 32);
    writer.flags(flags);
    writer.buffer(domain.as_bytes())?;
    writer.buffer(workstation.as_bytes())?;
    Ok(writer.finish())
}

/// Builds the type 3 message answering `challenge`.
///
/// `client_challenge` must be random and `timestamp` is the current time as
/// a Windows FILETIME; see [`filetime_now`].
///
/// # Errors
///
/// Returns [`Error::InvalidUsage`] if a name does not fit a message field.
pub fn authenticate_message(
    challenge: &Challenge,
    credentials: &NtlmCredentials<'_>,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>> {
    let key = ntowf_v2(credentials.user, credentials.domain, credentials.password)?;
    let lm = lmv2_response(&key, &challenge.server_challenge, &client_challenge)?;
    let nt = ntv2_response(
        &key,
        &challenge.server_challenge,
        &client_challenge,
        timestamp,
        &challenge.target_info,
    )?;

    let unicode = challenge.is_unicode();
    let encode = |s: &str| {
        if unicode {
            utf16le(s)
        } else {
            s.as_bytes().to_vec()
        }
    };

    let mut flags = BASE_FLAGS | if unicode { NEGOTIATE_UNICODE } else { NEGOTIATE_OEM };
    flags |= challenge.flags & NEGOTIATE_TARGET_INFO;

    let mut writer = MessageWriter::new(3, 64);
    writer.buffer(&lm)?;
    writer.buffer(&nt)?;
    writer.buffer(&encode(credentials.domain))?;
    writer.buffer(&encode(credentials.user))?;
    writer.buffer(&encode(credentials.workstation))?;
    writer.buffer(&[])?;
    writer.flags(flags);
    Ok(writer.finish())
}

/// MD4 of the UTF-16LE password.
#[must_use]
pub fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

/// NTLMv2 response key: HMAC-MD5 keyed by the NT hash over
/// `UPPER(user) || domain` in UTF-16LE.
///
/// # Errors
///
/// Never fails in practice; HMAC accepts any key length.
pub fn ntowf_v2(user: &str, domain: &str, password: &str) -> Result<[u8; 16]> {
    let identity = utf16le(&format!("{}{domain}", user.to_uppercase()));
    hmac_md5(&nt_hash(password), &[identity.as_slice()])
}

/// LMv2 response: the proof over both challenges, then the client challenge.
///
/// # Errors
///
/// Never fails in practice; HMAC accepts any key length.
pub fn lmv2_response(key: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> Result<Vec<u8>> {
    let proof = hmac_md5(key, &[&server_challenge[..], &client_challenge[..]])?;
    Ok([&proof[..], &client_challenge[..]].concat())
}

/// NTLMv2 response: `NTProofStr || blob`.
///
/// # Errors
///
/// Never fails in practice; HMAC accepts any key length.
pub fn ntv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<Vec<u8>> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(key, &[&server_challenge[..], blob.as_slice()])?;
    Ok([&proof[..], blob.as_slice()].concat())
}

/// Current time in 100ns ticks since 1601-01-01.
#[must_use]
pub fn filetime_now() -> u64 {
    let now = Utc::now();
    let ticks = (now.timestamp() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + i64::from(now.timestamp_subsec_nanos() / 100);
    u64::try_from(ticks).unwrap_or_default()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Protocol(format!("HMAC key rejected: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn read_u16(msg: &[u8], at: usize) -> Option<u16> {
    msg.get(at..at + 2)?.try_into().ok().map(u16::from_le_bytes)
}

fn read_u32(msg: &[u8], at: usize) -> Option<u32> {
    msg.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

fn read_buffer(msg: &[u8], at: usize) -> Option<&[u8]> {
    let len = usize::from(read_u16(msg, at)?);
    let offset = usize::try_from(read_u32(msg, at + 4)?).ok()?;
    msg.get(offset..offset.checked_add(len)?)
}

/// Lays out a fixed header of security buffers followed by their payload.
struct MessageWriter {
    header: Vec<u8>,
    payload: Vec<u8>,
    header_len: usize,
}

impl MessageWriter {
    fn new(message_type: u32, header_len: usize) -> Self {
        let mut header = Vec::with_capacity(header_len);
        header.extend_from_slice(SIGNATURE);
        header.extend_from_slice(&message_type.to_le_bytes());
        Self {
            header,
            payload: Vec::new(),
            header_len,
        }
    }

    fn flags(&mut self, flags: u32) {
        self.header.extend_from_slice(&flags.to_le_bytes());
    }

    fn buffer(&mut self, data: &[u8]) -> Result<()> {
        let too_long = || Error::usage("NTLM field too long");
        let len = u16::try_from(data.len()).map_err(|_| too_long())?;
        let offset = u32::try_from(self.header_len + self.payload.len()).map_err(|_| too_long())?;

        self.header.extend_from_slice(&len.to_le_bytes());
        self.header.extend_from_slice(&len.to_le_bytes());
        self.header.extend_from_slice(&offset.to_le_bytes());
        self.payload.extend_from_slice(data);
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert_eq!(self.header.len(), self.header_len);
        self.header.append(&mut self.payload);
        self.header
    }
}
