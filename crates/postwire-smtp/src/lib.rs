//! # postwire-smtp
//!
//! An asynchronous SMTP client session engine (RFC 5321).
//!
//! ## Features
//!
//! - **One I/O task per connection**: replies are correlated to requests in
//!   arrival order, with per-request timeouts
//! - **Pipelining** (RFC 2920) with the ordering rules checked before writing
//! - **Chunking** (RFC 3030) and `8BITMIME`, chosen per message from the
//!   server's capabilities
//! - **TLS**: STARTTLS (RFC 3207) in place, or implicit TLS, through a
//!   pluggable [`TlsProvider`]
//! - **Authentication**: PLAIN, LOGIN, XOAUTH2, NTLM
//! - **Guards**: SIZE limits and invalid usage are rejected before anything
//!   is written
//!
//! ## Quick Start
//!
//! ```ignore
//! use postwire_smtp::{Address, Command, MessageContent, SessionConfig, SessionFactory};
//!
//! #[tokio::main]
//! async fn main() -> postwire_smtp::Result<()> {
//!     let config = SessionConfig::builder("smtp.example.com").port(587).build();
//!     let factory = SessionFactory::new(config);
//!
//!     let (mut session, _greeting) = factory.connect().await?;
//!     session.send(Command::Ehlo { hostname: "client.example.com".into() }).await?;
//!     session.start_tls().await?;
//!     session.send(Command::Ehlo { hostname: "client.example.com".into() }).await?;
//!     session.auth_plain("user@example.com", "password").await?;
//!
//!     let from = Address::new("sender@example.com")?;
//!     let to = Address::new("recipient@example.com")?;
//!     let replies = session
//!         .send_mail(&from, &to, MessageContent::from("Subject: Test\r\n\r\nHello\r\n"))
//!         .await?;
//!     assert!(!replies.contains_error());
//!
//!     session.quit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! ┌───────────┐  EHLO   ┌───────┐  close / QUIT / failure  ┌────────┐
//! │ Connected │ ──────→ │ Ready │ ───────────────────────→ │ Closed │
//! └───────────┘         └───────┘                          └────────┘
//!       ↑     STARTTLS      │
//!       └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: SASL message construction
//! - [`codec`]: Outbound framing
//! - [`command`]: SMTP commands and pipelining rules
//! - [`connection`]: Streams, TLS and configuration
//! - [`content`]: Message content and dot-stuffing
//! - [`correlator`]: Reply correlation
//! - [`parser`]: Reply parser
//! - [`types`]: Addresses, extensions and replies

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

pub mod auth;
pub mod codec;
pub mod command;
pub mod connection;
pub mod content;
pub mod correlator;
mod error;
mod factory;
pub mod parser;
mod session;
pub mod types;

pub use command::Command;
pub use connection::{CompletionMode, RustlsProvider, SessionConfig, SessionConfigBuilder, TlsProvider};
pub use content::{ByteSource, ContentEncoding, MessageContent};
pub use correlator::ConnectionId;
pub use error::{Error, Result};
pub use factory::SessionFactory;
pub use session::{SessionState, SmtpSession};
pub use types::{Address, AuthMechanism, Capabilities, Extension, Replies, Reply, ReplyCode};

/// Boxed, sendable future used at trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
