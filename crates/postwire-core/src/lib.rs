//! # postwire-core
//!
//! Mail sending service on top of [`postwire_smtp`].
//!
//! This crate provides:
//! - A reusable [`MailSender`] that keeps one SMTP session open between sends
//! - Reconnection when the server has dropped the connection
//! - Security setup (plaintext, STARTTLS or implicit TLS)
//! - Authentication mechanism selection from the server's capabilities

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod service;

pub use service::{Credentials, Envelope, MailSender, Security, SenderConfig, SmtpError};
