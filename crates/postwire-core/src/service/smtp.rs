//! SMTP service for sending emails.
//!
//! Wraps a [`SessionFactory`] and keeps a single session open between sends.
//! A session the server has dropped is replaced transparently on the next
//! send; failed transactions are never retried.

use std::fmt;

use postwire_smtp::{
    Address, Command, Extension, MessageContent, Replies, Reply, SessionConfig, SessionFactory,
    SmtpSession,
};
use tokio::sync::Mutex;

/// Errors that can occur during SMTP operations.
#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    /// Connection failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server rejected the transaction.
    #[error("Rejected by server: {code} {message}")]
    Rejected {
        /// Reply code of the rejecting reply.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// Send failed.
    #[error("Send failed: {0}")]
    Send(String),

    /// Invalid address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Security mode not supported.
    #[error("Security mode not supported: {0}")]
    UnsupportedSecurity(String),
}

impl SmtpError {
    fn rejected(reply: &Reply) -> Self {
        Self::Rejected {
            code: reply.code.as_u16(),
            message: reply.message_text(),
        }
    }
}

/// Connection security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plaintext for the whole session.
    None,
    /// Plaintext connect, upgraded with STARTTLS before authenticating.
    #[default]
    StartTls,
    /// TLS from the first byte (usually port 465).
    Implicit,
}

/// Credentials for SMTP authentication.
#[derive(Clone)]
pub enum Credentials {
    /// Username and password, sent with PLAIN or LOGIN.
    Password {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// OAuth2 access token, sent with XOAUTH2.
    OAuth2Token {
        /// Account the token was issued for.
        username: String,
        /// Access token.
        token: String,
    },
    /// Windows domain credentials, sent with NTLM.
    Ntlm {
        /// Domain, may be empty.
        domain: String,
        /// Workstation name, may be empty.
        workstation: String,
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::OAuth2Token { username, .. } => f
                .debug_struct("OAuth2Token")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Ntlm {
                domain,
                workstation,
                username,
                ..
            } => f
                .debug_struct("Ntlm")
                .field("domain", domain)
                .field("workstation", workstation)
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Settings for a [`MailSender`].
#[derive(Debug)]
pub struct SenderConfig {
    /// Engine configuration: host, port, timeouts, TLS.
    pub session: SessionConfig,
    /// Name announced in EHLO.
    pub client_hostname: String,
    /// Connection security.
    pub security: Security,
    /// Credentials, if the server requires authentication.
    pub credentials: Option<Credentials>,
    /// Extra connection attempts after the first one fails.
    pub max_reconnect_attempts: u32,
}

impl SenderConfig {
    /// Creates a configuration with STARTTLS, no credentials and two
    /// reconnect attempts.
    #[must_use]
    pub fn new(session: SessionConfig, client_hostname: impl Into<String>) -> Self {
        Self {
            session,
            client_hostname: client_hostname.into(),
            security: Security::default(),
            credentials: None,
            max_reconnect_attempts: 2,
        }
    }

    /// Sets the connection security.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the number of extra connection attempts.
    #[must_use]
    pub const fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

/// Sender and recipients of one message.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Reverse-path. Empty for the null sender.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
}

impl Envelope {
    /// Creates an envelope with no recipients.
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    fn addresses(&self) -> Result<(Address, Vec<Address>), SmtpError> {
        if self.to.is_empty() {
            return Err(SmtpError::InvalidAddress("No recipients specified".into()));
        }

        let from = if self.from.is_empty() {
            Address::null()
        } else {
            Address::new(self.from.as_str()).map_err(|e| SmtpError::InvalidAddress(e.to_string()))?
        };
        let to = self
            .to
            .iter()
            .map(|addr| {
                Address::new(addr.as_str()).map_err(|e| SmtpError::InvalidAddress(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((from, to))
    }
}

/// Sends messages over a reused SMTP session.
///
/// # Example
///
/// ```ignore
/// use postwire_core::{Credentials, Envelope, MailSender, SenderConfig};
/// use postwire_smtp::{MessageContent, SessionConfig};
///
/// let session = SessionConfig::builder("smtp.example.com").port(587).build();
/// let config = SenderConfig::new(session, "client.example.com").credentials(
///     Credentials::Password {
///         username: "user@example.com".into(),
///         password: "secret".into(),
///     },
/// );
/// let sender = MailSender::new(config);
///
/// let envelope = Envelope::new("user@example.com").to("friend@example.com");
/// sender
///     .send(&envelope, MessageContent::from("Subject: Hi\r\n\r\nHello\r\n"))
///     .await?;
/// sender.close().await;
/// ```
pub struct MailSender {
    factory: SessionFactory,
    client_hostname: String,
    security: Security,
    credentials: Option<Credentials>,
    max_reconnect_attempts: u32,
    session: Mutex<Option<SmtpSession>>,
}

impl fmt::Debug for MailSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailSender")
            .field("host", &self.factory.config().host)
            .field("security", &self.security)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl MailSender {
    /// Creates a sender. No connection is made until the first send.
    #[must_use]
    pub fn new(config: SenderConfig) -> Self {
        Self {
            factory: SessionFactory::new(config.session),
            client_hostname: config.client_hostname,
            security: config.security,
            credentials: config.credentials,
            max_reconnect_attempts: config.max_reconnect_attempts,
            session: Mutex::new(None),
        }
    }

    /// Returns true if a session is open.
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(SmtpSession::is_active)
    }

    /// Sends one message and returns every reply of the transaction.
    ///
    /// Individually rejected recipients are reported in the replies; the
    /// send only fails when the transaction as a whole was refused.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is invalid, the connection or
    /// authentication fails, or the server rejects the message.
    pub async fn send(&self, envelope: &Envelope, content: MessageContent) -> Result<Replies, SmtpError> {
        let (from, to) = envelope.addresses()?;

        let mut guard = self.session.lock().await;
        if guard.as_ref().is_some_and(|session| !session.is_active()) {
            tracing::info!(host = %self.factory.config().host, "SMTP connection lost, reconnecting");
            *guard = None;
        }
        let session = match guard.take() {
            Some(session) => guard.insert(session),
            None => guard.insert(self.open().await?),
        };

        let result = session.send_mail_to_many(&from, &to, content).await;
        let replies = match result {
            Ok(replies) => replies,
            Err(e) if e.is_connection_lost() || e.is_timeout() => {
                *guard = None;
                return Err(SmtpError::Connection(e.to_string()));
            }
            Err(e) => return Err(SmtpError::Send(e.to_string())),
        };

        match replies.last() {
            Some(last) if last.is_error() => Err(SmtpError::rejected(last)),
            Some(_) => Ok(replies),
            None => Err(SmtpError::Send("No reply to the transaction".into())),
        }
    }

    /// Sends QUIT and closes the open session, if any.
    pub async fn close(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        if let Err(e) = session.quit().await {
            tracing::debug!(error = %e, "QUIT failed while closing");
        }
    }

    async fn open(&self) -> Result<SmtpSession, SmtpError> {
        let mut attempt = 0;
        loop {
            match self.establish().await {
                Ok(session) => return Ok(session),
                Err(SmtpError::Connection(reason)) if attempt < self.max_reconnect_attempts => {
                    attempt += 1;
                    tracing::info!(
                        host = %self.factory.config().host,
                        attempt,
                        %reason,
                        "Retrying SMTP connection"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn establish(&self) -> Result<SmtpSession, SmtpError> {
        let connected = match self.security {
            Security::Implicit => self.factory.connect_tls().await,
            Security::StartTls | Security::None => self.factory.connect().await,
        };
        let (mut session, greeting) = connected.map_err(|e| SmtpError::Connection(e.to_string()))?;
        if greeting.is_error() {
            let _ = session.close().await;
            return Err(SmtpError::Connection(format!(
                "Server refused the connection: {} {}",
                greeting.code.as_u16(),
                greeting.message_text()
            )));
        }

        match self.prepare(&mut session).await {
            Ok(()) => Ok(session),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    async fn prepare(&self, session: &mut SmtpSession) -> Result<(), SmtpError> {
        self.greet(session).await?;

        if self.security == Security::StartTls {
            if !session.capabilities().is_supported(&Extension::StartTls) {
                return Err(SmtpError::UnsupportedSecurity(
                    "Server does not offer STARTTLS".into(),
                ));
            }
            let reply = session
                .start_tls()
                .await
                .map_err(|e| SmtpError::Connection(e.to_string()))?;
            if reply.is_error() {
                return Err(SmtpError::Connection(format!(
                    "STARTTLS refused: {} {}",
                    reply.code.as_u16(),
                    reply.message_text()
                )));
            }
            self.greet(session).await?;
        }

        if let Some(credentials) = &self.credentials {
            authenticate(session, credentials).await?;
        }
        Ok(())
    }

    /// EHLO, falling back to HELO for servers without ESMTP.
    async fn greet(&self, session: &mut SmtpSession) -> Result<(), SmtpError> {
        let ehlo = Command::Ehlo {
            hostname: self.client_hostname.clone(),
        };
        let reply = session
            .send(ehlo)
            .await
            .map_err(|e| SmtpError::Connection(e.to_string()))?;
        if reply.is_success() {
            return Ok(());
        }

        tracing::debug!(code = reply.code.as_u16(), "EHLO refused, trying HELO");
        let helo = Command::Helo {
            hostname: self.client_hostname.clone(),
        };
        let reply = session
            .send(helo)
            .await
            .map_err(|e| SmtpError::Connection(e.to_string()))?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(SmtpError::Connection(format!(
                "HELO refused: {} {}",
                reply.code.as_u16(),
                reply.message_text()
            )))
        }
    }
}

async fn authenticate(session: &mut SmtpSession, credentials: &Credentials) -> Result<(), SmtpError> {
    let plain = session.capabilities().is_auth_plain_supported();
    let login = session.capabilities().is_auth_login_supported();
    let result = match credentials {
        Credentials::Password { username, password } => {
            if plain {
                session.auth_plain(username, password).await
            } else if login {
                session.auth_login(username, password).await
            } else {
                return Err(SmtpError::Authentication(
                    "Server offers neither PLAIN nor LOGIN".into(),
                ));
            }
        }
        Credentials::OAuth2Token { username, token } => {
            session.auth_xoauth2(username, token).await
        }
        Credentials::Ntlm {
            domain,
            workstation,
            username,
            password,
        } => session.auth_ntlm(domain, workstation, username, password).await,
    };

    let reply = result.map_err(|e| SmtpError::Authentication(e.to_string()))?;
    if reply.is_success() {
        Ok(())
    } else {
        Err(SmtpError::Authentication(format!(
            "{} {}",
            reply.code.as_u16(),
            reply.message_text()
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_builder() {
        let envelope = Envelope::new("a@example.com")
            .to("b@example.com")
            .to("c@example.com");
        assert_eq!(envelope.from, "a@example.com");
        assert_eq!(envelope.to, vec!["b@example.com", "c@example.com"]);
    }

    #[test]
    fn test_envelope_without_recipients() {
        let err = Envelope::new("a@example.com").addresses().unwrap_err();
        assert!(matches!(err, SmtpError::InvalidAddress(_)));
    }

    #[test]
    fn test_envelope_null_sender() {
        let (from, to) = Envelope::new("").to("b@example.com").addresses().unwrap();
        assert!(from.is_null());
        assert_eq!(to.len(), 1);
    }

    #[test]
    fn test_envelope_invalid_recipient() {
        let err = Envelope::new("a@example.com")
            .to("not an address")
            .addresses()
            .unwrap_err();
        assert!(matches!(err, SmtpError::InvalidAddress(_)));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let credentials = Credentials::Password {
            username: "user".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));

        let credentials = Credentials::OAuth2Token {
            username: "user".into(),
            token: "ya29.secret".into(),
        };
        assert!(!format!("{credentials:?}").contains("ya29"));
    }

    #[test]
    fn test_sender_config_defaults() {
        let config = SenderConfig::new(SessionConfig::new("smtp.example.com"), "client.test");
        assert_eq!(config.security, Security::StartTls);
        assert!(config.credentials.is_none());
        assert_eq!(config.max_reconnect_attempts, 2);

        let config = config.security(Security::Implicit).max_reconnect_attempts(0);
        assert_eq!(config.security, Security::Implicit);
        assert_eq!(config.max_reconnect_attempts, 0);
    }

    #[test]
    fn test_rejected_display() {
        let err = SmtpError::Rejected {
            code: 550,
            message: "No such user".into(),
        };
        assert_eq!(err.to_string(), "Rejected by server: 550 No such user");
    }
}
