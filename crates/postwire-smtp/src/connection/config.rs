//! Session configuration.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use super::stream::{RustlsProvider, TlsProvider};
use crate::correlator::{ConnectionId, ErrorHandler};
use crate::types::Extension;

/// Default SMTP submission port without implicit TLS.
pub const DEFAULT_PORT: u16 = 25;

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for a reply group.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a completed response wait resumes.
#[derive(Debug, Clone, Default)]
pub enum CompletionMode {
    /// The awaiting task resumes directly.
    #[default]
    Direct,
    /// Each wait is spawned onto this runtime and joined.
    Runtime(Handle),
}

/// Settings shared by every session a factory creates.
#[derive(Clone)]
pub struct SessionConfig {
    /// Server hostname or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Default reply timeout; `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
    /// Greeting timeout; falls back to `response_timeout`.
    pub initial_response_timeout: Option<Duration>,
    /// Extensions treated as absent even when advertised.
    pub disabled_extensions: HashSet<Extension>,
    /// TLS engine for STARTTLS and implicit TLS.
    pub tls: Arc<dyn TlsProvider>,
    /// Name checked against the server certificate; defaults to `host`.
    pub tls_server_name: Option<String>,
    /// Completion marshalling for response waits.
    pub completion: CompletionMode,
    /// Receives connection errors that arrive with nothing pending.
    pub error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("initial_response_timeout", &self.initial_response_timeout)
            .field("disabled_extensions", &self.disabled_extensions)
            .field("tls_server_name", &self.tls_server_name)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Creates a configuration with defaults for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            initial_response_timeout: None,
            disabled_extensions: HashSet::new(),
            tls: Arc::new(RustlsProvider::new()),
            tls_server_name: None,
            completion: CompletionMode::Direct,
            error_handler: None,
        }
    }

    /// Starts a builder for `host`.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(host)
    }

    /// Name used for certificate verification.
    #[must_use]
    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }

    /// Timeout applied to the server greeting.
    #[must_use]
    pub fn greeting_timeout(&self) -> Option<Duration> {
        self.initial_response_timeout.or(self.response_timeout)
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Creates a builder with defaults for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: SessionConfig::new(host),
        }
    }

    /// Sets the server port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the TCP connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the default reply timeout; `None` disables it.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Sets the greeting timeout.
    #[must_use]
    pub const fn initial_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.initial_response_timeout = Some(timeout);
        self
    }

    /// Hides an extension from every parsed capability set.
    #[must_use]
    pub fn disable_extension(mut self, extension: Extension) -> Self {
        self.config.disabled_extensions.insert(extension);
        self
    }

    /// Replaces the TLS engine.
    #[must_use]
    pub fn tls_provider(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.config.tls = provider;
        self
    }

    /// Overrides the certificate name.
    #[must_use]
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.tls_server_name = Some(name.into());
        self
    }

    /// Sets where response waits complete.
    #[must_use]
    pub fn completion(mut self, mode: CompletionMode) -> Self {
        self.config.completion = mode;
        self
    }

    /// Installs a handler for connection errors with nothing pending.
    #[must_use]
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionId, &std::io::Error) + Send + Sync + 'static,
    {
        self.config.error_handler = Some(Arc::new(handler));
        self
    }

    /// Finishes the configuration.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        self.config
    }
}
