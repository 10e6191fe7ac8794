//! SMTP response parser.
//!
//! [`ReplyDecoder`] turns the inbound byte stream into complete replies.
//! It keeps partial input between calls so it can sit behind a cancel-safe
//! `read_buf` loop.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Maximum reply line length to prevent memory exhaustion.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Maximum number of lines in one multi-line reply.
const MAX_REPLY_LINES: usize = 1024;

/// Parses an SMTP reply from response lines.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// # Errors
///
/// Returns an error if the reply is malformed.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    if lines.is_empty() {
        return Err(Error::Protocol("Empty reply".into()));
    }

    // Parse code from first line
    let first = &lines[0];
    if first.len() < 3 {
        return Err(Error::Protocol(format!("Reply too short: {first}")));
    }

    let code = first
        .get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| Error::Protocol(format!("Invalid reply code: {first}")))?;

    let reply_code = ReplyCode::new(code);

    // Extract message from all lines
    let mut message = Vec::new();
    for line in lines {
        if line.len() < 3 {
            return Err(Error::Protocol(format!("Malformed reply line: {line}")));
        }
        // Skip code and separator (e.g., "250-" or "250 ")
        message.push(line.get(4..).unwrap_or_default().to_string());
    }

    Ok(Reply::new(reply_code, message))
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.len() >= 4 && line.as_bytes()[3] == b' '
}

/// Incremental decoder for multi-line SMTP replies.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    lines: Vec<String>,
}

impl ReplyDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { lines: Vec::new() }
    }

    /// Decodes the next complete reply from `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` when more input is needed. Lines of an unfinished
    /// multi-line reply are kept across calls.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for over-long or malformed lines.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Reply>> {
        loop {
            let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
                if buf.len() > MAX_LINE_LENGTH {
                    return Err(Error::Protocol("Reply line too long".into()));
                }
                return Ok(None);
            };

            let raw = buf.split_to(newline + 1);
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();

            if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
                self.lines.clear();
                return Err(Error::Protocol(format!("Malformed reply line: {line}")));
            }

            let last = line.len() == 3 || is_last_reply_line(&line);
            self.lines.push(line);

            if last {
                let lines = std::mem::take(&mut self.lines);
                return parse_reply(&lines).map(Some);
            }

            if self.lines.len() > MAX_REPLY_LINES {
                self.lines.clear();
                return Err(Error::Protocol("Too many reply lines".into()));
            }
        }
    }

    /// Returns true if part of a multi-line reply has been buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.lines.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line_reply() {
        let lines = vec!["250 OK".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["OK"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let lines = vec![
            "250-First line".to_string(),
            "250-Second line".to_string(),
            "250 Last line".to_string(),
        ];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(
            reply.message,
            vec!["First line", "Second line", "Last line"]
        );
    }

    #[test]
    fn test_parse_greeting() {
        let lines = vec!["220 smtp.example.com ESMTP ready".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code.as_u16(), 220);
        assert_eq!(reply.message, vec!["smtp.example.com ESMTP ready"]);
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(!is_last_reply_line("250"));
    }

    #[test]
    fn test_parse_error_empty() {
        assert!(parse_reply(&[]).is_err());
    }

    #[test]
    fn test_parse_error_too_short() {
        let lines = vec!["25".to_string()];
        assert!(parse_reply(&lines).is_err());
    }

    #[test]
    fn test_parse_error_invalid_code() {
        let lines = vec!["ABC OK".to_string()];
        assert!(parse_reply(&lines).is_err());
    }

    #[test]
    fn test_decoder_waits_for_full_reply() {
        let mut decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(&b"250-mx.example.com\r\n250-PIPE"[..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(decoder.has_partial());

        buf.extend_from_slice(b"LINING\r\n250 8BITMIME\r\n");
        let reply = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, ReplyCode::OK);
        assert_eq!(reply.message, vec!["mx.example.com", "PIPELINING", "8BITMIME"]);
        assert!(buf.is_empty());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_yields_replies_in_order() {
        let mut decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(&b"250 OK\r\n550 No such user\r\n354 Go\r\n"[..]);

        let codes: Vec<u16> = std::iter::from_fn(|| decoder.decode(&mut buf).unwrap())
            .map(|r| r.code.as_u16())
            .collect();
        assert_eq!(codes, vec![250, 550, 354]);
    }

    #[test]
    fn test_decoder_accepts_bare_lf_and_code_only() {
        let mut decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(&b"250\n"[..]);
        let reply = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec![String::new()]);
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decoder_rejects_long_line() {
        let mut decoder = ReplyDecoder::new();
        let mut buf = BytesMut::from(vec![b'2'; MAX_LINE_LENGTH + 1].as_slice());
        assert!(decoder.decode(&mut buf).is_err());
    }
}
