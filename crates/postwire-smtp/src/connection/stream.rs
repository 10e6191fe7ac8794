//! Transport streams and the pluggable TLS engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore},
};

use crate::BoxFuture;
use crate::error::{Error, Result};

/// Any ordered, reliable byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream, plain or encrypted.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Performs TLS handshakes over an already open stream.
///
/// Used both for STARTTLS, which upgrades the stream in place, and for
/// implicit TLS connections.
pub trait TlsProvider: Send + Sync {
    /// Runs the client handshake for `server_name` over `stream`.
    fn connect(&self, server_name: &str, stream: BoxedStream) -> BoxFuture<'static, Result<BoxedStream>>;
}

impl fmt::Debug for dyn TlsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsProvider")
    }
}

/// Default provider using rustls with the webpki root store.
#[derive(Clone)]
pub struct RustlsProvider {
    connector: TlsConnector,
}

impl fmt::Debug for RustlsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsProvider").finish_non_exhaustive()
    }
}

impl RustlsProvider {
    /// Creates a provider trusting the bundled web PKI roots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connector: create_tls_connector(),
        }
    }

    /// Creates a provider from a custom client configuration.
    #[must_use]
    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

impl Default for RustlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsProvider for RustlsProvider {
    fn connect(&self, server_name: &str, stream: BoxedStream) -> BoxFuture<'static, Result<BoxedStream>> {
        let connector = self.connector.clone();
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::InvalidDnsName(server_name.to_string()));

        Box::pin(async move {
            let tls_stream = connector.connect(server_name?, stream).await?;
            Ok(Box::new(tls_stream) as BoxedStream)
        })
    }
}

/// Opens a TCP connection, failing after `timeout`.
///
/// # Errors
///
/// Returns an error if the connection fails or times out.
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::ConnectTimeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Creates a TLS connector with the web PKI root certificates.
fn create_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
