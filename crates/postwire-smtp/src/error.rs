//! Error types for SMTP session operations.
//!
//! Server replies with 4xx/5xx codes are not errors at this level: they are
//! returned as ordinary [`Reply`](crate::Reply) values so that callers can
//! inspect per-recipient failures inside a pipelined batch.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::correlator::ConnectionId;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(String),

    /// Protocol error (malformed reply).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// The operation is not valid in the session's current state or with
    /// the server's advertised capabilities. Nothing was written.
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Message content exceeds the size advertised by the server.
    #[error("[{connection_id}] Message exceeds the maximum size of {max_size} bytes")]
    MessageTooLarge {
        /// Connection the send was attempted on.
        connection_id: ConnectionId,
        /// Limit advertised with the SIZE extension.
        max_size: u64,
    },

    /// No reply arrived within the response timeout.
    #[error("[{connection_id}] Timed out waiting for a response to [{description}]")]
    ResponseTimeout {
        /// Connection that timed out.
        connection_id: ConnectionId,
        /// What was sent.
        description: String,
    },

    /// The connection closed while a reply was pending.
    #[error("[{connection_id}] Channel closed while waiting for a response to [{description}]")]
    ConnectionClosed {
        /// Connection that closed.
        connection_id: ConnectionId,
        /// What was sent.
        description: String,
    },

    /// An I/O failure occurred while a reply was pending.
    #[error("[{connection_id}] Transport failure while waiting for a response to [{description}]: {source}")]
    Transport {
        /// Connection that failed.
        connection_id: ConnectionId,
        /// What was sent.
        description: String,
        /// Underlying failure.
        #[source]
        source: Arc<io::Error>,
    },

    /// The connection terminated abnormally.
    #[error("[{connection_id}] Connection terminated: {cause}")]
    Terminated {
        /// Connection that terminated.
        connection_id: ConnectionId,
        /// Terminal cause.
        cause: Arc<io::Error>,
    },

    /// TCP connect did not finish in time.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server's capabilities leave no correct way to send the content.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// A completion task on the configured runtime failed.
    #[error("Completion failed: {0}")]
    Completion(String),
}

impl Error {
    /// Returns true for guard violations that were caught before any write.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUsage(_) | Self::MessageTooLarge { .. } | Self::NotImplemented(_)
        )
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. } | Self::ConnectTimeout(_))
    }

    /// Returns true if the connection is gone after this error.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. } | Self::Transport { .. } | Self::Terminated { .. }
        )
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::InvalidUsage(message.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_connection_and_request() {
        let err = Error::ResponseTimeout {
            connection_id: ConnectionId::new("conn-1"),
            description: "NOOP".into(),
        };
        assert_eq!(
            err.to_string(),
            "[conn-1] Timed out waiting for a response to [NOOP]"
        );
        assert!(err.is_timeout());
        assert!(!err.is_usage_error());
    }

    #[test]
    fn classification() {
        assert!(Error::usage("nope").is_usage_error());
        assert!(
            Error::MessageTooLarge {
                connection_id: ConnectionId::new("c"),
                max_size: 10,
            }
            .is_usage_error()
        );
        assert!(
            Error::ConnectionClosed {
                connection_id: ConnectionId::new("c"),
                description: String::new(),
            }
            .is_connection_lost()
        );
    }
}
