//! Transport plumbing: streams, TLS, configuration and the I/O driver.

mod config;
pub(crate) mod driver;
mod stream;

pub use config::{
    CompletionMode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT, DEFAULT_RESPONSE_TIMEOUT,
    SessionConfig, SessionConfigBuilder,
};
pub use driver::{CloseReason, LinkState};
pub use stream::{AsyncStream, BoxedStream, RustlsProvider, TlsProvider, connect_tcp};
