//! SMTP command builder.
//!
//! Commands serialize to a single CRLF-terminated line. The RFC 2920 rules
//! for which commands may share a pipelined group live here as well, see
//! [`validate_pipeline`].

use std::fmt;

use crate::error::{Error, Result};
use crate::types::{Address, AuthMechanism};

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
        /// Initial response (optional, for SASL-IR)
        initial_response: Option<String>,
    },
    /// A bare SASL continuation line sent after a 334 challenge.
    AuthResponse(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address
        from: Address,
        /// BODY parameter (7BIT, 8BITMIME)
        body: Option<String>,
        /// SIZE parameter
        size: Option<u64>,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data {
        /// BODY parameter, only sent on the 8BITMIME path.
        body: Option<String>,
    },
    /// BDAT - Send one chunk of message data
    Bdat {
        /// Octet count of the chunk that follows the command line.
        size: u64,
        /// Whether this is the final chunk.
        last: bool,
    },
    /// RSET - Reset transaction
    Rset,
    /// VRFY - Verify address
    Vrfy {
        /// Address to verify
        address: String,
    },
    /// EXPN - Expand mailing list
    Expn {
        /// List to expand
        list: String,
    },
    /// HELP - Ask for help text
    Help {
        /// Optional topic
        topic: Option<String>,
    },
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Plain `DATA`.
    #[must_use]
    pub const fn data() -> Self {
        Self::Data { body: None }
    }

    /// `MAIL FROM:<from>` with no parameters.
    #[must_use]
    pub const fn mail(from: Address) -> Self {
        Self::MailFrom {
            from,
            body: None,
            size: None,
        }
    }

    /// `RCPT TO:<to>`.
    #[must_use]
    pub const fn rcpt(to: Address) -> Self {
        Self::RcptTo { to }
    }

    /// Rejects free-text arguments that would break the command line.
    ///
    /// Addresses are checked when they are built; this covers the rest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if an argument contains a control
    /// character such as CR or LF.
    pub fn check_arguments(&self) -> Result<()> {
        let argument = match self {
            Self::Helo { hostname } | Self::Ehlo { hostname } => Some(hostname.as_str()),
            Self::Auth {
                initial_response, ..
            } => initial_response.as_deref(),
            Self::AuthResponse(line) => Some(line.as_str()),
            Self::MailFrom { body, .. } | Self::Data { body } => body.as_deref(),
            Self::Vrfy { address } => Some(address.as_str()),
            Self::Expn { list } => Some(list.as_str()),
            Self::Help { topic } => topic.as_deref(),
            Self::StartTls | Self::RcptTo { .. } | Self::Bdat { .. } | Self::Rset | Self::Noop | Self::Quit => None,
        };

        match argument {
            Some(text) if text.chars().any(char::is_control) => Err(Error::usage(format!(
                "{} argument contains control characters",
                self.verb().map_or("AUTH continuation", Verb::as_str)
            ))),
            _ => Ok(()),
        }
    }

    /// Returns the command verb, or `None` for a SASL continuation line.
    #[must_use]
    pub const fn verb(&self) -> Option<Verb> {
        Some(match self {
            Self::Helo { .. } => Verb::Helo,
            Self::Ehlo { .. } => Verb::Ehlo,
            Self::StartTls => Verb::StartTls,
            Self::Auth { .. } => Verb::Auth,
            Self::AuthResponse(_) => return None,
            Self::MailFrom { .. } => Verb::Mail,
            Self::RcptTo { .. } => Verb::Rcpt,
            Self::Data { .. } => Verb::Data,
            Self::Bdat { .. } => Verb::Bdat,
            Self::Rset => Verb::Rset,
            Self::Vrfy { .. } => Verb::Vrfy,
            Self::Expn { .. } => Verb::Expn,
            Self::Help { .. } => Verb::Help,
            Self::Noop => Verb::Noop,
            Self::Quit => Verb::Quit,
        })
    }

    /// Returns true if the command carries credentials.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::AuthResponse(_))
    }

    /// Returns true if a positive reply switches the server into DATA mode.
    #[must_use]
    pub const fn opens_content(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    /// Returns a log-safe description of the command.
    ///
    /// Credentials are never included.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.is_sensitive() {
            return "<redacted-auth-command>".to_string();
        }
        self.to_string()
    }

    /// Serializes the command to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        self.write_to(&mut buf);
        buf
    }

    /// Appends the serialized command, including CRLF, to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo { hostname } => write!(f, "HELO {hostname}"),
            Self::Ehlo { hostname } => write!(f, "EHLO {hostname}"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth {
                mechanism,
                initial_response,
            } => {
                write!(f, "AUTH {}", mechanism.as_str())?;
                if let Some(resp) = initial_response {
                    write!(f, " {resp}")?;
                }
                Ok(())
            }
            Self::AuthResponse(line) => f.write_str(line),
            Self::MailFrom { from, body, size } => {
                write!(f, "MAIL FROM:{from}")?;
                if let Some(body_type) = body {
                    write!(f, " BODY={body_type}")?;
                }
                if let Some(msg_size) = size {
                    write!(f, " SIZE={msg_size}")?;
                }
                Ok(())
            }
            Self::RcptTo { to } => write!(f, "RCPT TO:{to}"),
            Self::Data { body: None } => f.write_str("DATA"),
            Self::Data { body: Some(body) } => write!(f, "DATA BODY={body}"),
            Self::Bdat { size, last: false } => write!(f, "BDAT {size}"),
            Self::Bdat { size, last: true } => write!(f, "BDAT {size} LAST"),
            Self::Rset => f.write_str("RSET"),
            Self::Vrfy { address } => write!(f, "VRFY {address}"),
            Self::Expn { list } => write!(f, "EXPN {list}"),
            Self::Help { topic: None } => f.write_str("HELP"),
            Self::Help { topic: Some(topic) } => write!(f, "HELP {topic}"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

/// SMTP command verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// HELO
    Helo,
    /// EHLO
    Ehlo,
    /// STARTTLS
    StartTls,
    /// AUTH
    Auth,
    /// MAIL
    Mail,
    /// RCPT
    Rcpt,
    /// DATA
    Data,
    /// BDAT
    Bdat,
    /// RSET
    Rset,
    /// VRFY
    Vrfy,
    /// EXPN
    Expn,
    /// HELP
    Help,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
}

impl Verb {
    /// Returns the verb as sent on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth => "AUTH",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Bdat => "BDAT",
            Self::Rset => "RSET",
            Self::Vrfy => "VRFY",
            Self::Expn => "EXPN",
            Self::Help => "HELP",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
        }
    }

    /// RFC 2920 §3.1: may appear anywhere in a pipelined group.
    #[must_use]
    pub const fn is_pipelinable_anywhere(self) -> bool {
        matches!(self, Self::Rset | Self::Mail | Self::Rcpt)
    }

    /// RFC 2920 §3.1: may appear as the last command of a pipelined group.
    #[must_use]
    pub const fn is_pipelinable_last(self) -> bool {
        self.is_pipelinable_anywhere()
            || matches!(
                self,
                Self::Ehlo | Self::Data | Self::Vrfy | Self::Expn | Self::Quit | Self::Noop
            )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks a pipelined command group against RFC 2920.
///
/// # Errors
///
/// Returns [`Error::InvalidUsage`] naming the first offending command.
pub fn validate_pipeline(commands: &[Command]) -> Result<()> {
    if commands.is_empty() {
        return Err(Error::usage("You must provide requests to pipeline"));
    }

    let last = commands.len() - 1;
    for (i, command) in commands.iter().enumerate() {
        command.check_arguments()?;
        let Some(verb) = command.verb() else {
            return Err(Error::usage(
                "AUTH continuation lines cannot be used in a pipelined request",
            ));
        };

        if i == last {
            if !verb.is_pipelinable_last() {
                return Err(Error::usage(format!(
                    "{verb} cannot be used in a pipelined request"
                )));
            }
        } else if !verb.is_pipelinable_anywhere() {
            let reason = if verb.is_pipelinable_last() {
                "must appear last in"
            } else {
                "cannot be used in"
            };
            return Err(Error::usage(format!("{verb} {reason} a pipelined request")));
        }
    }

    Ok(())
}
