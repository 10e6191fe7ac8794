//! SMTP extension types and the capability set negotiated with EHLO.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// SMTP extension keyword advertised in an EHLO response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication
    Auth,
    /// SIZE - Maximum message size
    Size,
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// CHUNKING - Chunked message transfer (BDAT)
    Chunking,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// DSN - Delivery status notifications
    Dsn,
    /// BINARYMIME - Binary MIME
    BinaryMime,
    /// ENHANCEDSTATUSCODES - RFC 2034 status codes
    EnhancedStatusCodes,
    /// Any other keyword, upper-cased.
    Unknown(String),
}

impl Extension {
    /// Maps an EHLO keyword to an extension, case-insensitively.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Self {
        let keyword = keyword.to_ascii_uppercase();
        match keyword.as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth,
            "SIZE" => Self::Size,
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "CHUNKING" => Self::Chunking,
            "SMTPUTF8" => Self::SmtpUtf8,
            "DSN" => Self::Dsn,
            "BINARYMIME" => Self::BinaryMime,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            _ => Self::Unknown(keyword),
        }
    }

    /// Returns the keyword as advertised on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::Size => "SIZE",
            Self::EightBitMime => "8BITMIME",
            Self::Pipelining => "PIPELINING",
            Self::Chunking => "CHUNKING",
            Self::SmtpUtf8 => "SMTPUTF8",
            Self::Dsn => "DSN",
            Self::BinaryMime => "BINARYMIME",
            Self::EnhancedStatusCodes => "ENHANCEDSTATUSCODES",
            Self::Unknown(keyword) => keyword,
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - plaintext authentication
    Plain,
    /// LOGIN - legacy plaintext
    Login,
    /// CRAM-MD5 - challenge-response
    CramMd5,
    /// `XOAUTH2` - `OAuth2` (Google/Microsoft)
    XOAuth2,
    /// `OAUTHBEARER` - RFC 7628 `OAuth2`
    OAuthBearer,
    /// NTLM - Microsoft challenge-response
    Ntlm,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            "OAUTHBEARER" => Some(Self::OAuthBearer),
            "NTLM" => Some(Self::Ntlm),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
            Self::OAuthBearer => "OAUTHBEARER",
            Self::Ntlm => "NTLM",
        }
    }
}

/// Server capabilities from one EHLO response.
///
/// A new set replaces the previous one after every EHLO; nothing is merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    hostname: String,
    extensions: HashMap<Extension, Vec<String>>,
    auth: HashSet<AuthMechanism>,
}

impl Capabilities {
    /// Parses the message lines of an EHLO reply.
    ///
    /// The first line is the server's greeting. Every following line is a
    /// keyword with optional whitespace-separated parameters. Extensions in
    /// `disabled` are dropped even when advertised.
    #[must_use]
    pub fn parse<S: AsRef<str>>(lines: &[S], disabled: &HashSet<Extension>) -> Self {
        let mut caps = Self {
            hostname: lines
                .first()
                .and_then(|line| line.as_ref().split_whitespace().next())
                .unwrap_or_default()
                .to_string(),
            ..Self::default()
        };

        for line in lines.iter().skip(1) {
            let mut words = line.as_ref().split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };

            // Some servers still announce "AUTH=PLAIN LOGIN".
            let (keyword, inline_param) = match first.split_once('=') {
                Some((keyword, param)) => (keyword, Some(param)),
                None => (first, None),
            };

            let extension = Extension::from_keyword(keyword);
            if disabled.contains(&extension) {
                continue;
            }

            let params = caps.extensions.entry(extension).or_default();
            params.extend(
                inline_param
                    .into_iter()
                    .filter(|p| !p.is_empty())
                    .chain(words)
                    .map(str::to_string),
            );
        }

        if let Some(params) = caps.extensions.get(&Extension::Auth) {
            caps.auth = params.iter().filter_map(|m| AuthMechanism::parse(m)).collect();
        }

        caps
    }

    /// Returns the hostname the server announced on the first EHLO line.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Checks if the server supports an extension.
    #[must_use]
    pub fn is_supported(&self, ext: &Extension) -> bool {
        self.extensions.contains_key(ext)
    }

    /// Returns the parameters advertised for an extension.
    #[must_use]
    pub fn parameters(&self, ext: &Extension) -> Option<&[String]> {
        self.extensions.get(ext).map(Vec::as_slice)
    }

    /// Returns the maximum message size, if a usable one was advertised.
    ///
    /// A missing, zero or malformed SIZE value means there is no limit.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.parameters(&Extension::Size)?
            .first()?
            .parse::<u64>()
            .ok()
            .filter(|&size| size > 0)
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub const fn auth_mechanisms(&self) -> &HashSet<AuthMechanism> {
        &self.auth
    }

    /// Checks if the server accepts the given SASL mechanism.
    #[must_use]
    pub fn supports_auth(&self, mechanism: AuthMechanism) -> bool {
        self.auth.contains(&mechanism)
    }

    /// Checks if AUTH PLAIN is supported.
    #[must_use]
    pub fn is_auth_plain_supported(&self) -> bool {
        self.supports_auth(AuthMechanism::Plain)
    }

    /// Checks if AUTH LOGIN is supported.
    #[must_use]
    pub fn is_auth_login_supported(&self) -> bool {
        self.supports_auth(AuthMechanism::Login)
    }

    /// Checks if AUTH XOAUTH2 is supported.
    #[must_use]
    pub fn is_auth_xoauth2_supported(&self) -> bool {
        self.supports_auth(AuthMechanism::XOAuth2)
    }

    /// Checks if AUTH NTLM is supported.
    #[must_use]
    pub fn is_ntlm_supported(&self) -> bool {
        self.supports_auth(AuthMechanism::Ntlm)
    }

    /// Returns true before any EHLO has been parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hostname.is_empty() && self.extensions.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> Capabilities {
        Capabilities::parse(lines, &HashSet::new())
    }

    mod capability_parse_tests {
        use super::*;

        #[test]
        fn parse_typical_ehlo() {
            let caps = parse(&[
                "smtp.example.com Hello client",
                "PIPELINING",
                "SIZE 52428800",
                "8BITMIME",
                "CHUNKING",
                "STARTTLS",
                "AUTH PLAIN LOGIN",
            ]);
            assert_eq!(caps.hostname(), "smtp.example.com");
            assert!(caps.is_supported(&Extension::Pipelining));
            assert!(caps.is_supported(&Extension::EightBitMime));
            assert!(caps.is_supported(&Extension::Chunking));
            assert!(caps.is_supported(&Extension::StartTls));
            assert!(!caps.is_supported(&Extension::SmtpUtf8));
            assert_eq!(caps.max_message_size(), Some(52_428_800));
            assert!(caps.is_auth_plain_supported());
            assert!(caps.is_auth_login_supported());
            assert!(!caps.is_auth_xoauth2_supported());
        }

        #[test]
        fn greeting_line_is_not_an_extension() {
            let caps = parse(&["PIPELINING"]);
            assert!(!caps.is_supported(&Extension::Pipelining));
        }

        #[test]
        fn keywords_are_case_insensitive() {
            let caps = parse(&["host", "starttls", "auth xoauth2 ntlm"]);
            assert!(caps.is_supported(&Extension::StartTls));
            assert!(caps.is_auth_xoauth2_supported());
            assert!(caps.is_ntlm_supported());
        }

        #[test]
        fn legacy_auth_equals_syntax() {
            let caps = parse(&["host", "AUTH=PLAIN LOGIN"]);
            assert!(caps.is_supported(&Extension::Auth));
            assert!(caps.is_auth_plain_supported());
            assert!(caps.is_auth_login_supported());
        }

        #[test]
        fn disabled_extension_is_dropped() {
            let disabled = HashSet::from([Extension::Chunking]);
            let caps = Capabilities::parse(&["host", "CHUNKING", "PIPELINING"], &disabled);
            assert!(!caps.is_supported(&Extension::Chunking));
            assert!(caps.is_supported(&Extension::Pipelining));
        }

        #[test]
        fn unknown_extension_keeps_parameters() {
            let caps = parse(&["host", "X-CUSTOM a b"]);
            let ext = Extension::Unknown("X-CUSTOM".into());
            assert!(caps.is_supported(&ext));
            assert_eq!(caps.parameters(&ext).unwrap(), ["a", "b"]);
        }

        #[test]
        fn blank_lines_are_ignored() {
            let caps = parse(&["host", "", "   ", "DSN"]);
            assert!(caps.is_supported(&Extension::Dsn));
        }

        #[test]
        fn empty_before_ehlo() {
            assert!(Capabilities::default().is_empty());
            assert!(!parse(&["host"]).is_empty());
        }
    }

    mod size_tests {
        use super::*;

        #[test]
        fn size_without_value_is_unbounded() {
            assert_eq!(parse(&["host", "SIZE"]).max_message_size(), None);
        }

        #[test]
        fn malformed_size_is_unbounded() {
            assert_eq!(parse(&["host", "SIZE lots"]).max_message_size(), None);
            assert_eq!(parse(&["host", "SIZE -5"]).max_message_size(), None);
        }

        #[test]
        fn zero_size_is_unbounded() {
            assert_eq!(parse(&["host", "SIZE 0"]).max_message_size(), None);
        }

        #[test]
        fn absent_size_is_unbounded() {
            assert_eq!(parse(&["host", "8BITMIME"]).max_message_size(), None);
        }
    }

    mod auth_mechanism_tests {
        use super::*;

        #[test]
        fn parse_names() {
            assert_eq!(AuthMechanism::parse("PLAIN"), Some(AuthMechanism::Plain));
            assert_eq!(AuthMechanism::parse("plain"), Some(AuthMechanism::Plain));
            assert_eq!(AuthMechanism::parse("LOGIN"), Some(AuthMechanism::Login));
            assert_eq!(
                AuthMechanism::parse("CRAM-MD5"),
                Some(AuthMechanism::CramMd5)
            );
            assert_eq!(
                AuthMechanism::parse("XOAUTH2"),
                Some(AuthMechanism::XOAuth2)
            );
            assert_eq!(AuthMechanism::parse("ntlm"), Some(AuthMechanism::Ntlm));
            assert_eq!(AuthMechanism::parse("UNKNOWN"), None);
        }

        #[test]
        fn as_str() {
            assert_eq!(AuthMechanism::Plain.as_str(), "PLAIN");
            assert_eq!(AuthMechanism::OAuthBearer.as_str(), "OAUTHBEARER");
            assert_eq!(AuthMechanism::Ntlm.as_str(), "NTLM");
        }

        #[test]
        fn unrecognised_mechanisms_are_skipped() {
            let caps = parse(&["host", "AUTH GSSAPI PLAIN"]);
            assert_eq!(caps.auth_mechanisms().len(), 1);
            assert!(caps.is_auth_plain_supported());
        }
    }

    #[test]
    fn extension_keyword_round_trip() {
        for ext in [
            Extension::StartTls,
            Extension::EightBitMime,
            Extension::Chunking,
            Extension::Unknown("XFOO".into()),
        ] {
            assert_eq!(Extension::from_keyword(ext.as_str()), ext);
        }
        assert_eq!(Extension::from_keyword("xfoo").to_string(), "XFOO");
    }
}
