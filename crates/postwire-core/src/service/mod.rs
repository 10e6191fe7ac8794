//! Services that sit between callers and the SMTP session engine.

pub mod smtp;

pub use smtp::{Credentials, Envelope, MailSender, Security, SenderConfig, SmtpError};
