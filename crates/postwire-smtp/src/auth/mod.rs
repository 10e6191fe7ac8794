//! SASL messages for SMTP AUTH (RFC 4954).
//!
//! Implements:
//! - PLAIN (RFC 4616)
//! - LOGIN (draft-murchison-sasl-login)
//! - XOAUTH2 (Google/Microsoft proprietary)
//! - NTLM, NTLMv2 responses only; see [`ntlm`]

pub mod ntlm;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Generates the PLAIN initial response.
///
/// Format: `<user>\0<user>\0<password>` (base64 encoded). The user is sent
/// as both authorization and authentication identity.
///
/// # Example
///
/// ```
/// use postwire_smtp::auth::plain_response;
///
/// let response = plain_response("user@example.com", "password123");
/// // Send: AUTH PLAIN {response}
/// ```
#[must_use]
pub fn plain_response(username: &str, password: &str) -> String {
    let auth_string = format!("{username}\0{username}\0{password}");
    STANDARD.encode(auth_string.as_bytes())
}

/// Encodes one LOGIN step: the username, then the password.
#[must_use]
pub fn login_response(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

/// Generates the XOAUTH2 initial response.
///
/// Format: `user=<user>\x01auth=Bearer <token>\x01\x01`
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> String {
    let auth_string = format!("user={user}\x01auth=Bearer {token}\x01\x01");
    STANDARD.encode(auth_string.as_bytes())
}

/// Decodes a base64 server challenge from a 334 reply.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the challenge is not valid base64.
pub fn decode_challenge(challenge: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(challenge.trim())
        .map_err(|e| Error::Protocol(format!("Invalid SASL challenge: {e}")))
}

/// Encodes a binary client response.
#[must_use]
pub fn encode_response(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    fn decode(response: &str) -> String {
        String::from_utf8(STANDARD.decode(response).unwrap()).unwrap()
    }

    #[test]
    fn test_plain_response_format() {
        assert_eq!(decode(&plain_response("test", "pass")), "test\0test\0pass");
    }

    #[test]
    fn test_plain_response_special_chars() {
        let decoded = decode(&plain_response("user", "pass@word!"));
        assert_eq!(decoded, "user\0user\0pass@word!");
    }

    #[test]
    fn test_login_response() {
        assert_eq!(login_response("user"), "dXNlcg==");
        assert_eq!(decode(&login_response("secret")), "secret");
    }

    #[test]
    fn test_xoauth2_format() {
        let decoded = decode(&xoauth2_response("test@test.com", "abc"));
        assert_eq!(decoded, "user=test@test.com\x01auth=Bearer abc\x01\x01");
    }

    #[test]
    fn test_responses_are_base64() {
        let response = xoauth2_response("user@example.com", "token");
        assert!(!response.contains("user@example.com"));
        assert!(STANDARD.decode(&response).is_ok());
    }

    #[test]
    fn test_decode_challenge() {
        assert_eq!(decode_challenge(" VXNlcm5hbWU6 ").unwrap(), b"Username:");
        assert!(matches!(
            decode_challenge("not base64!"),
            Err(Error::Protocol(_))
        ));
    }
}
