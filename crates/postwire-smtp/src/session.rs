//! The per-connection SMTP session.
//!
//! A session owns the negotiated capability set and the small amount of
//! transaction state that must survive between calls: whether the next
//! transaction needs an `RSET` first, how many BDAT bytes have been sent in
//! the current message, and whether the server is waiting for DATA content.
//! All methods take `&mut self`, so one session never runs two transactions
//! at once.
//!
//! Every guard (capabilities, pipelining legality, message size, state) is
//! checked before anything is written.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};

use crate::auth::{self, ntlm};
use crate::codec::{Frame, describe_frames};
use crate::command::{Command, validate_pipeline};
use crate::connection::driver::{CloseReason, LinkState, Op};
use crate::connection::{CompletionMode, SessionConfig};
use crate::content::{ContentEncoding, MessageContent};
use crate::correlator::{ConnectionId, Correlator, ResponseFuture};
use crate::error::{Error, Result};
use crate::types::{Address, AuthMechanism, Capabilities, Extension, Replies, Reply, ReplyCode};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Greeted, but no usable EHLO or HELO since connect or STARTTLS.
    Connected {
        /// True once TLS is active.
        encrypted: bool,
    },
    /// Capabilities are known; transactions may run.
    Ready {
        /// True once TLS is active.
        encrypted: bool,
    },
    /// The connection is gone.
    Closed,
}

/// How a whole message is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// `BDAT <size> LAST` with the raw bytes.
    Chunked,
    /// `DATA`, or `DATA BODY=8BITMIME`, with dot-stuffed content.
    Data { eight_bit: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Normal,
    Recipient { last: bool },
}

/// One write and the replies it waits for.
struct Step {
    frames: Vec<Frame>,
    expected: usize,
    kind: StepKind,
}

impl Step {
    fn command(command: Command, kind: StepKind) -> Self {
        Self {
            frames: vec![command.into()],
            expected: 1,
            kind,
        }
    }
}

/// An SMTP session bound to one connection.
pub struct SmtpSession {
    id: ConnectionId,
    ops: mpsc::UnboundedSender<Op>,
    link: watch::Receiver<LinkState>,
    correlator: Correlator,
    config: Arc<SessionConfig>,
    capabilities: Capabilities,
    negotiated: bool,
    requires_reset: bool,
    chunk_bytes: u64,
    awaiting_content: bool,
}

impl fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("capabilities", &self.capabilities)
            .field("requires_reset", &self.requires_reset)
            .finish_non_exhaustive()
    }
}

impl SmtpSession {
    pub(crate) fn new(
        id: ConnectionId,
        ops: mpsc::UnboundedSender<Op>,
        link: watch::Receiver<LinkState>,
        correlator: Correlator,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            id,
            ops,
            link,
            correlator,
            config,
            capabilities: Capabilities::default(),
            negotiated: false,
            requires_reset: false,
            chunk_bytes: 0,
            awaiting_content: false,
        }
    }

    /// Identity used to correlate replies on this connection.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    /// Capabilities from the most recent EHLO; empty before the first.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns true while the connection is open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.link.borrow().closed.is_none()
    }

    /// Returns true once TLS is active, implicit or via STARTTLS.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.link.borrow().encrypted
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        let link = self.link.borrow();
        if link.closed.is_some() {
            SessionState::Closed
        } else if self.negotiated {
            SessionState::Ready {
                encrypted: link.encrypted,
            }
        } else {
            SessionState::Connected {
                encrypted: link.encrypted,
            }
        }
    }

    /// Sends one command and returns its reply.
    ///
    /// An EHLO reply replaces the capability set before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] for STARTTLS and BDAT, which have
    /// dedicated methods, or for arguments containing line breaks, or a
    /// connection error.
    pub async fn send(&mut self, command: Command) -> Result<Reply> {
        match command {
            Command::StartTls => return Err(Error::usage("Use start_tls() to upgrade the connection")),
            Command::Bdat { .. } => return Err(Error::usage("Use send_chunk() to send BDAT chunks")),
            _ => {}
        }
        command.check_arguments()?;

        let is_ehlo = matches!(command, Command::Ehlo { .. });
        let is_helo = matches!(command, Command::Helo { .. });
        let opens_content = command.opens_content();

        let reply = self.exchange_one(vec![command.into()]).await?;

        if is_ehlo {
            self.update_capabilities(&reply);
        } else if is_helo {
            self.capabilities = Capabilities::default();
            self.negotiated = reply.is_success();
        }
        self.awaiting_content = opens_content && reply.code.is_intermediate();
        Ok(reply)
    }

    /// Sends message content after DATA was accepted with 354.
    ///
    /// The content is dot-stuffed and followed by the `.` line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if the content exceeds the SIZE
    /// limit, or [`Error::InvalidUsage`] if the server is not waiting for
    /// content.
    pub async fn send_content(&mut self, content: MessageContent) -> Result<Reply> {
        self.ensure_open("[CONTENT]")?;
        if !self.awaiting_content {
            return Err(Error::usage(
                "Message content can only follow a DATA command accepted with 354",
            ));
        }
        self.check_message_size(content.size())?;

        self.awaiting_content = false;
        self.exchange_one(content.dot_stuffed_view().into()).await
    }

    /// Sends one BDAT chunk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server lacks CHUNKING, or
    /// [`Error::MessageTooLarge`] if the chunks sent so far for this message
    /// would exceed the SIZE limit.
    pub async fn send_chunk(&mut self, chunk: Bytes, is_last: bool) -> Result<Reply> {
        self.ensure_ready("BDAT")?;
        if !self.capabilities.is_supported(&Extension::Chunking) {
            return Err(Error::usage("Chunking is not supported on this server"));
        }

        let size = chunk.len() as u64;
        let total = self.chunk_bytes + size;
        self.check_message_size(total)?;
        self.chunk_bytes = if is_last { 0 } else { total };

        let content = MessageContent::new(chunk, ContentEncoding::EightBit);
        let frames = vec![
            Command::Bdat { size, last: is_last }.into(),
            content.chunk_view(),
        ];
        self.exchange_one(frames).await
    }

    /// Sends several commands in one write (RFC 2920).
    ///
    /// `content`, if any, goes first and completes a DATA accepted earlier.
    /// One reply is returned per command, plus one for the content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server lacks PIPELINING or the
    /// group breaks the ordering rules, and [`Error::MessageTooLarge`] for
    /// oversized content.
    pub async fn send_pipelined(
        &mut self,
        content: Option<MessageContent>,
        commands: Vec<Command>,
    ) -> Result<Replies> {
        self.ensure_ready("a pipelined request")?;
        if !self.capabilities.is_supported(&Extension::Pipelining) {
            return Err(Error::usage("Pipelining is not supported on this server"));
        }
        validate_pipeline(&commands)?;

        let mut frames = Vec::with_capacity(commands.len() + 2);
        if let Some(content) = &content {
            if !self.awaiting_content {
                return Err(Error::usage(
                    "Message content can only follow a DATA command accepted with 354",
                ));
            }
            self.check_message_size(content.size())?;
            frames.extend(content.dot_stuffed_view());
        }

        let expected = commands.len() + usize::from(content.is_some());
        let ends_with_data = commands.last().is_some_and(Command::opens_content);
        let ends_with_ehlo = matches!(commands.last(), Some(Command::Ehlo { .. }));
        frames.extend(commands.into_iter().map(Frame::from));

        self.awaiting_content = false;
        let replies = Replies::new(self.exchange(frames, expected).await?);

        if let Some(last) = replies.last() {
            if ends_with_ehlo {
                self.update_capabilities(last);
            }
            self.awaiting_content = ends_with_data && last.code.is_intermediate();
        }
        Ok(replies)
    }

    /// Sends one message to one recipient.
    ///
    /// See [`send_mail_to_many`](Self::send_mail_to_many).
    ///
    /// # Errors
    ///
    /// As for [`send_mail_to_many`](Self::send_mail_to_many).
    pub async fn send_mail(
        &mut self,
        from: &Address,
        to: &Address,
        content: MessageContent,
    ) -> Result<Replies> {
        self.send_mail_to_many(from, std::slice::from_ref(to), content)
            .await
    }

    /// Runs a complete mail transaction and returns every reply in order.
    ///
    /// The transfer method follows the server's capabilities: BDAT when
    /// CHUNKING is advertised, otherwise DATA, with `BODY=8BITMIME` for
    /// 8-bit content. Commands are pipelined when the server allows it.
    /// Every transaction after the first on a session starts with `RSET`.
    ///
    /// The transaction stops after the first step whose last reply is an
    /// error; rejected recipients only stop it when all were rejected.
    /// Server rejections are returned as replies, not errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`] if the content exceeds the SIZE
    /// limit, [`Error::NotImplemented`] for 8-bit content the server cannot
    /// accept, or a connection error.
    pub async fn send_mail_to_many(
        &mut self,
        from: &Address,
        to: &[Address],
        content: MessageContent,
    ) -> Result<Replies> {
        self.ensure_ready("a mail transaction")?;
        if to.is_empty() {
            return Err(Error::usage("At least one recipient is required"));
        }
        self.check_message_size(content.size())?;

        let strategy = self.select_strategy(&content).await?;
        let steps = self.plan_transaction(strategy, from, to, &content);
        tracing::debug!(
            connection = %self.id,
            ?strategy,
            recipients = to.len(),
            size = content.size(),
            "Starting mail transaction"
        );
        self.run_steps(steps).await
    }

    /// Upgrades the connection with STARTTLS (RFC 3207).
    ///
    /// A 4xx/5xx reply is returned as is and the connection stays in
    /// plaintext. After a successful handshake the session is back in
    /// [`SessionState::Connected`] until EHLO is sent again; the old
    /// capability set is kept until then.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if TLS is already active, or the
    /// handshake failure, in which case the connection is closed.
    pub async fn start_tls(&mut self) -> Result<Reply> {
        self.ensure_open("STARTTLS")?;
        if self.is_encrypted() {
            return Err(Error::usage("This connection is already using TLS"));
        }

        let reply = self.exchange_one(vec![Command::StartTls.into()]).await?;
        if reply.is_error() {
            return Ok(reply);
        }

        let (done, handshake) = oneshot::channel();
        let op = Op::StartTls {
            server_name: self.config.server_name().to_string(),
            provider: Arc::clone(&self.config.tls),
            done,
        };
        if self.ops.send(op).is_err() {
            return Err(self.closed_error("TLS handshake"));
        }
        handshake
            .await
            .unwrap_or_else(|_| Err(self.closed_error("TLS handshake")))?;

        self.negotiated = false;
        self.awaiting_content = false;
        Ok(reply)
    }

    /// Authenticates with AUTH PLAIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server does not offer PLAIN.
    pub async fn auth_plain(&mut self, user: &str, password: &str) -> Result<Reply> {
        self.ensure_ready("AUTH PLAIN")?;
        if !self.capabilities.is_auth_plain_supported() {
            return Err(Error::usage("Auth plain is not supported on this server"));
        }

        self.send(Command::Auth {
            mechanism: AuthMechanism::Plain,
            initial_response: Some(auth::plain_response(user, password)),
        })
        .await
    }

    /// Authenticates with AUTH LOGIN.
    ///
    /// The password is only sent after a 334 continuation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server does not offer LOGIN.
    pub async fn auth_login(&mut self, user: &str, password: &str) -> Result<Reply> {
        self.ensure_ready("AUTH LOGIN")?;
        if !self.capabilities.is_auth_login_supported() {
            return Err(Error::usage("Auth login is not supported on this server"));
        }

        let reply = self
            .send(Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: Some(auth::login_response(user)),
            })
            .await?;
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return Ok(reply);
        }

        self.send(Command::AuthResponse(auth::login_response(password)))
            .await
    }

    /// Authenticates with AUTH XOAUTH2.
    ///
    /// A failed token is answered with a 334 carrying an error document;
    /// an empty line is sent back to obtain the final reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server does not offer XOAUTH2.
    pub async fn auth_xoauth2(&mut self, user: &str, token: &str) -> Result<Reply> {
        self.ensure_ready("AUTH XOAUTH2")?;
        if !self.capabilities.is_auth_xoauth2_supported() {
            return Err(Error::usage("XOAUTH2 is not supported on this server"));
        }

        let reply = self
            .send(Command::Auth {
                mechanism: AuthMechanism::XOAuth2,
                initial_response: Some(auth::xoauth2_response(user, token)),
            })
            .await?;
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return Ok(reply);
        }

        tracing::debug!(connection = %self.id, "XOAUTH2 token rejected, finishing exchange");
        self.send(Command::AuthResponse(String::new())).await
    }

    /// Authenticates with AUTH NTLM using an NTLMv2 response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if the server does not offer NTLM, or
    /// [`Error::Protocol`] for a malformed challenge, after cancelling the
    /// exchange with `*`.
    pub async fn auth_ntlm(
        &mut self,
        domain: &str,
        workstation: &str,
        user: &str,
        password: &str,
    ) -> Result<Reply> {
        self.ensure_ready("AUTH NTLM")?;
        if !self.capabilities.is_ntlm_supported() {
            return Err(Error::usage("NTLM is not supported on this server"));
        }

        let negotiate = ntlm::negotiate_message(domain, workstation)?;
        let reply = self
            .send(Command::Auth {
                mechanism: AuthMechanism::Ntlm,
                initial_response: Some(auth::encode_response(&negotiate)),
            })
            .await?;
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return Ok(reply);
        }

        let credentials = ntlm::NtlmCredentials {
            domain,
            workstation,
            user,
            password,
        };
        let client_challenge = rand::thread_rng().r#gen::<[u8; 8]>();
        let authenticate = reply
            .message
            .first()
            .ok_or_else(|| Error::Protocol("Empty NTLM challenge".into()))
            .and_then(|challenge| auth::decode_challenge(challenge))
            .and_then(|bytes| ntlm::Challenge::parse(&bytes))
            .and_then(|challenge| {
                ntlm::authenticate_message(
                    &challenge,
                    &credentials,
                    client_challenge,
                    ntlm::filetime_now(),
                )
            });

        match authenticate {
            Ok(message) => {
                self.send(Command::AuthResponse(auth::encode_response(&message)))
                    .await
            }
            Err(e) => {
                tracing::warn!(connection = %self.id, error = %e, "Cancelling NTLM exchange");
                self.send(Command::AuthResponse("*".into())).await?;
                Err(e)
            }
        }
    }

    /// Sends QUIT, then closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the QUIT failure, or the terminal cause if the connection
    /// ended abnormally.
    pub async fn quit(&mut self) -> Result<Reply> {
        let reply = self.send(Command::Quit).await;
        self.close().await?;
        reply
    }

    /// Closes the connection without sending anything and waits for it.
    ///
    /// Every pending reply wait fails with [`Error::ConnectionClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] if the connection had already failed.
    pub async fn close(&mut self) -> Result<()> {
        let _ = self.ops.send(Op::Close);
        self.closed().await
    }

    /// Resolves when the connection terminates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] with the cause if the connection ended
    /// abnormally.
    pub async fn closed(&self) -> Result<()> {
        let mut link = self.link.clone();
        let reason = match link.wait_for(|state| state.closed.is_some()).await {
            Ok(state) => state.closed.clone(),
            Err(_) => None,
        };

        match reason {
            Some(CloseReason::Failed(cause)) => Err(Error::Terminated {
                connection_id: self.id.clone(),
                cause,
            }),
            Some(CloseReason::Graceful) | None => Ok(()),
        }
    }

    pub(crate) async fn read_greeting(&self, future: ResponseFuture) -> Result<Reply> {
        self.complete(future, first_reply).await
    }

    async fn select_strategy(&self, content: &MessageContent) -> Result<Strategy> {
        if self.capabilities.is_supported(&Extension::Chunking) {
            return Ok(Strategy::Chunked);
        }
        if content.encoding() == ContentEncoding::SevenBit {
            return Ok(Strategy::Data { eight_bit: false });
        }
        if self.capabilities.is_supported(&Extension::EightBitMime) {
            return Ok(Strategy::Data { eight_bit: true });
        }
        if content.count_non_ascii_octets().await? == 0 {
            return Ok(Strategy::Data { eight_bit: false });
        }

        Err(Error::NotImplemented(
            "8-bit content needs 8BITMIME or CHUNKING; 7-bit re-encoding is not supported".into(),
        ))
    }

    fn plan_transaction(
        &mut self,
        strategy: Strategy,
        from: &Address,
        to: &[Address],
        content: &MessageContent,
    ) -> Vec<Step> {
        let pipelining = self.capabilities.is_supported(&Extension::Pipelining);

        let mut envelope = Vec::with_capacity(to.len() + 3);
        if std::mem::replace(&mut self.requires_reset, true) {
            envelope.push(Command::Rset);
        }
        envelope.push(Command::mail(from.clone()));
        envelope.extend(to.iter().cloned().map(Command::rcpt));
        envelope.push(match strategy {
            Strategy::Chunked => Command::Bdat {
                size: content.size(),
                last: true,
            },
            Strategy::Data { eight_bit } => Command::Data {
                body: eight_bit.then(|| "8BITMIME".to_string()),
            },
        });

        let mut steps = Vec::with_capacity(envelope.len() + 1);
        if pipelining {
            steps.push(Step {
                expected: envelope.len(),
                frames: envelope.into_iter().map(Frame::from).collect(),
                kind: StepKind::Normal,
            });
        } else {
            let recipients = to.len();
            let mut seen = 0;
            for command in envelope {
                let kind = if matches!(command, Command::RcptTo { .. }) {
                    seen += 1;
                    StepKind::Recipient {
                        last: seen == recipients,
                    }
                } else {
                    StepKind::Normal
                };
                // RSET shares the first write with MAIL.
                match steps.last_mut() {
                    Some(step) if step.frames.len() == 1 && matches!(step.frames[0], Frame::Command(Command::Rset)) => {
                        step.frames.push(command.into());
                        step.expected += 1;
                    }
                    _ => steps.push(Step::command(command, kind)),
                }
            }
        }

        match strategy {
            Strategy::Chunked => {
                if let Some(step) = steps.last_mut() {
                    step.frames.push(content.chunk_view());
                }
            }
            Strategy::Data { .. } => steps.push(Step {
                frames: content.dot_stuffed_view().into(),
                expected: 1,
                kind: StepKind::Normal,
            }),
        }
        steps
    }

    async fn run_steps(&mut self, steps: Vec<Step>) -> Result<Replies> {
        let mut all = Replies::default();
        let mut accepted = 0usize;

        for step in steps {
            let replies = Replies::new(self.exchange(step.frames, step.expected).await?);
            let failed = replies.last().is_none_or(Reply::is_error);
            all.extend(replies);

            let stop = match step.kind {
                StepKind::Normal => failed,
                StepKind::Recipient { last } => {
                    accepted += usize::from(!failed);
                    last && accepted == 0
                }
            };
            if stop {
                tracing::debug!(connection = %self.id, "Transaction stopped by server reply");
                break;
            }
        }

        self.awaiting_content = false;
        Ok(all)
    }

    fn update_capabilities(&mut self, reply: &Reply) {
        self.capabilities = Capabilities::parse(&reply.message, &self.config.disabled_extensions);
        self.negotiated = reply.is_success();
        tracing::debug!(
            connection = %self.id,
            hostname = self.capabilities.hostname(),
            capabilities = ?self.capabilities,
            "Capabilities updated"
        );
    }

    fn check_message_size(&self, size: u64) -> Result<()> {
        match self.capabilities.max_message_size() {
            Some(max_size) if size > max_size => Err(Error::MessageTooLarge {
                connection_id: self.id.clone(),
                max_size,
            }),
            _ => Ok(()),
        }
    }

    fn ensure_open(&self, what: &str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(self.closed_error(what))
        }
    }

    fn ensure_ready(&self, what: &str) -> Result<()> {
        self.ensure_open(what)?;
        if self.negotiated {
            Ok(())
        } else {
            Err(Error::usage(format!(
                "{what} requires a successful EHLO first"
            )))
        }
    }

    fn closed_error(&self, what: &str) -> Error {
        Error::ConnectionClosed {
            connection_id: self.id.clone(),
            description: what.to_string(),
        }
    }

    async fn exchange(&self, frames: Vec<Frame>, expected: usize) -> Result<Vec<Reply>> {
        self.exchange_with(frames, expected, Ok).await
    }

    async fn exchange_one(&self, frames: Vec<Frame>) -> Result<Reply> {
        self.exchange_with(frames, 1, first_reply).await
    }

    async fn exchange_with<T, F>(&self, frames: Vec<Frame>, expected: usize, map: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Vec<Reply>) -> Result<T> + Send + 'static,
    {
        let description = describe_frames(&frames);
        self.ensure_open(&description)?;

        tracing::trace!(connection = %self.id, request = %description, expected, "Sending");
        let future = self
            .correlator
            .create_response_future(&self.id, expected, None, move || description.clone())?;

        if self.ops.send(Op::Write(frames)).is_err() {
            self.correlator.on_connection_closed(&self.id);
        }
        self.complete(future, map).await
    }

    async fn complete<T, F>(&self, future: ResponseFuture, map: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Vec<Reply>) -> Result<T> + Send + 'static,
    {
        let result = match &self.config.completion {
            CompletionMode::Direct => future.await.and_then(map),
            CompletionMode::Runtime(handle) => handle
                .spawn(async move { map(future.await?) })
                .await
                .unwrap_or_else(|e| Err(Error::Completion(e.to_string()))),
        };

        if matches!(result, Err(Error::ResponseTimeout { .. })) {
            // Late replies to the timed-out group would pair with the next request.
            tracing::warn!(connection = %self.id, "Closing connection after response timeout");
            let _ = self.ops.send(Op::Close);
            let _ = self.closed().await;
        }
        result
    }
}

fn first_reply(replies: Vec<Reply>) -> Result<Reply> {
    replies
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("No reply received".into()))
}
