//! Creates sessions and keeps track of their connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};

use crate::connection::driver::{self, LinkState, Op};
use crate::connection::{AsyncStream, BoxedStream, SessionConfig, connect_tcp};
use crate::correlator::{ConnectionId, Correlator};
use crate::error::Result;
use crate::session::SmtpSession;
use crate::types::Reply;

struct Registered {
    ops: mpsc::WeakUnboundedSender<Op>,
    link: watch::Receiver<LinkState>,
}

impl Registered {
    fn is_open(&self) -> bool {
        self.link.borrow().closed.is_none()
    }
}

/// Connects SMTP sessions that share one configuration and one correlator.
///
/// # Example
///
/// ```ignore
/// use postwire_smtp::{Command, SessionConfig, SessionFactory};
///
/// let factory = SessionFactory::new(SessionConfig::new("smtp.example.com"));
/// let (mut session, greeting) = factory.connect().await?;
/// assert!(greeting.is_success());
/// session.send(Command::Ehlo { hostname: "client.example.com".into() }).await?;
/// ```
pub struct SessionFactory {
    config: Arc<SessionConfig>,
    correlator: Correlator,
    registry: Mutex<HashMap<ConnectionId, Registered>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    /// Creates a factory for `config`.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let correlator = Correlator::new(config.response_timeout, config.error_handler.clone());
        Self {
            config: Arc::new(config),
            correlator,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The configuration every session shares.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens a plaintext TCP connection and reads the greeting.
    ///
    /// A 4xx/5xx greeting is returned with the session; the caller decides
    /// whether to continue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the greeting does not
    /// arrive in time.
    pub async fn connect(&self) -> Result<(SmtpSession, Reply)> {
        let stream = connect_tcp(&self.config.host, self.config.port, self.config.connect_timeout).await?;
        let peer = self.peer_description(stream.peer_addr().ok());
        self.start(Box::new(stream), &peer, false).await
    }

    /// Opens a connection with implicit TLS (usually port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails or the
    /// greeting does not arrive in time.
    pub async fn connect_tls(&self) -> Result<(SmtpSession, Reply)> {
        let stream = connect_tcp(&self.config.host, self.config.port, self.config.connect_timeout).await?;
        let peer = self.peer_description(stream.peer_addr().ok());
        let stream = self
            .config
            .tls
            .connect(self.config.server_name(), Box::new(stream))
            .await?;
        self.start(stream, &peer, true).await
    }

    /// Starts a session over an already connected plaintext stream.
    ///
    /// `peer` only labels the connection id.
    ///
    /// # Errors
    ///
    /// Returns an error if the greeting does not arrive.
    pub async fn connect_with<S: AsyncStream>(&self, stream: S, peer: &str) -> Result<(SmtpSession, Reply)> {
        self.start(Box::new(stream), peer, false).await
    }

    /// Number of connections that are still open.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.is_open())
            .count()
    }

    /// Closes every connection this factory created and waits for them.
    ///
    /// Pending reply waits on those connections fail with
    /// [`Error::ConnectionClosed`](crate::Error::ConnectionClosed).
    pub async fn close_all(&self) {
        let entries: Vec<Registered> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        tracing::debug!(connections = entries.len(), "Closing all connections");
        for entry in &entries {
            if let Some(ops) = entry.ops.upgrade() {
                let _ = ops.send(Op::Close);
            }
        }
        for mut entry in entries {
            let _ = entry.link.wait_for(|state| state.closed.is_some()).await;
        }
    }

    async fn start(&self, stream: BoxedStream, peer: &str, encrypted: bool) -> Result<(SmtpSession, Reply)> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId::new(format!("{peer}#{n}"));
        tracing::debug!(connection = %id, encrypted, "Connected");

        // Registered before the driver reads, so an early greeting is kept.
        let greeting = self.correlator.create_response_future(
            &id,
            1,
            self.config.greeting_timeout(),
            || "initial response".to_string(),
        )?;

        let (ops, link) = driver::spawn(id.clone(), stream, encrypted, self.correlator.clone());
        self.register(&id, &ops, &link);

        let mut session = SmtpSession::new(id, ops, link, self.correlator.clone(), Arc::clone(&self.config));
        match session.read_greeting(greeting).await {
            Ok(reply) => Ok((session, reply)),
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    fn register(&self, id: &ConnectionId, ops: &mpsc::UnboundedSender<Op>, link: &watch::Receiver<LinkState>) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.retain(|_, entry| entry.is_open());
        registry.insert(
            id.clone(),
            Registered {
                ops: ops.downgrade(),
                link: link.clone(),
            },
        );
    }

    fn peer_description(&self, addr: Option<std::net::SocketAddr>) -> String {
        addr.map_or_else(
            || format!("{}:{}", self.config.host, self.config.port),
            |addr| addr.to_string(),
        )
    }
}
