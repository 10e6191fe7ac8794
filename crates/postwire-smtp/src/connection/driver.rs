//! The single task that owns a connection's stream.
//!
//! All reads and writes for one connection happen here, so replies are
//! delivered to the correlator strictly in arrival order. Sessions talk to
//! the driver through an unbounded channel of [`Op`]s and observe it through
//! a [`LinkState`] watch channel.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::stream::{BoxedStream, TlsProvider};
use crate::codec::{Frame, RequestEncoder};
use crate::correlator::{ConnectionId, Correlator};
use crate::error::Result;
use crate::parser::ReplyDecoder;

const READ_BUFFER_SIZE: usize = 8192;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Work requested from the driver.
pub(crate) enum Op {
    /// Write frames and flush once.
    Write(Vec<Frame>),
    /// Upgrade the stream to TLS in place.
    StartTls {
        server_name: String,
        provider: Arc<dyn TlsProvider>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Shut the connection down.
    Close,
}

/// How a connection ended.
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// Closed on request or by the peer.
    Graceful,
    /// Ended by an I/O, protocol or handshake failure.
    Failed(Arc<io::Error>),
}

/// Connection status published by the driver.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    /// True once TLS is active.
    pub encrypted: bool,
    /// Set when the driver has exited.
    pub closed: Option<CloseReason>,
}

enum Event {
    Op(Option<Op>),
    Read(io::Result<usize>),
}

struct Driver {
    id: ConnectionId,
    stream: Option<BoxedStream>,
    ops: mpsc::UnboundedReceiver<Op>,
    state: watch::Sender<LinkState>,
    correlator: Correlator,
    encoder: RequestEncoder,
    decoder: ReplyDecoder,
    read_buf: BytesMut,
}

/// Starts the driver task for `stream`.
pub(crate) fn spawn(
    id: ConnectionId,
    stream: BoxedStream,
    encrypted: bool,
    correlator: Correlator,
) -> (mpsc::UnboundedSender<Op>, watch::Receiver<LinkState>) {
    let (ops_tx, ops) = mpsc::unbounded_channel();
    let (state, link) = watch::channel(LinkState {
        encrypted,
        closed: None,
    });

    let driver = Driver {
        id,
        stream: Some(stream),
        ops,
        state,
        correlator,
        encoder: RequestEncoder::new(),
        decoder: ReplyDecoder::new(),
        read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
    };
    tokio::spawn(driver.run());

    (ops_tx, link)
}

impl Driver {
    async fn run(mut self) {
        let reason = self.drive().await;

        self.ops.close();
        self.correlator.on_connection_closed(&self.id);

        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await;
        }

        tracing::debug!(connection = %self.id, ?reason, "Connection closed");
        self.state.send_modify(|state| state.closed = Some(reason));
    }

    async fn drive(&mut self) -> CloseReason {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return CloseReason::Graceful;
            };

            let event = tokio::select! {
                op = self.ops.recv() => Event::Op(op),
                read = stream.read_buf(&mut self.read_buf) => Event::Read(read),
            };

            match event {
                Event::Op(None | Some(Op::Close)) => return CloseReason::Graceful,
                Event::Op(Some(Op::Write(frames))) => {
                    tracing::trace!(connection = %self.id, frames = frames.len(), "Write");
                    if let Err(e) = self.encoder.write_frames(&frames, stream).await {
                        return self.fail(e);
                    }
                }
                Event::Op(Some(Op::StartTls {
                    server_name,
                    provider,
                    done,
                })) => {
                    if let Err(reason) = self.upgrade(&server_name, provider.as_ref(), done).await {
                        return reason;
                    }
                }
                Event::Read(Ok(0)) => {
                    if !self.read_buf.is_empty() || self.decoder.has_partial() {
                        tracing::warn!(connection = %self.id, "Connection closed mid-reply");
                    }
                    return CloseReason::Graceful;
                }
                Event::Read(Ok(_)) => loop {
                    match self.decoder.decode(&mut self.read_buf) {
                        Ok(Some(reply)) => self.correlator.on_response(&self.id, reply),
                        Ok(None) => break,
                        Err(e) => {
                            return self.fail(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                        }
                    }
                },
                Event::Read(Err(e)) => return self.fail(e),
            }
        }
    }

    async fn upgrade(
        &mut self,
        server_name: &str,
        provider: &dyn TlsProvider,
        done: oneshot::Sender<Result<()>>,
    ) -> std::result::Result<(), CloseReason> {
        if !self.read_buf.is_empty() || self.decoder.has_partial() {
            tracing::warn!(
                connection = %self.id,
                bytes = self.read_buf.len(),
                "Discarding plaintext received before TLS handshake"
            );
            self.read_buf.clear();
            self.decoder = ReplyDecoder::new();
        }

        let Some(plain) = self.stream.take() else {
            return Err(CloseReason::Graceful);
        };

        match provider.connect(server_name, plain).await {
            Ok(tls) => {
                self.stream = Some(tls);
                self.state.send_modify(|state| state.encrypted = true);
                tracing::debug!(connection = %self.id, "TLS established");
                let _ = done.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection = %self.id, error = %e, "TLS handshake failed");
                let cause = Arc::new(io::Error::other(e.to_string()));
                let _ = done.send(Err(e));
                Err(CloseReason::Failed(cause))
            }
        }
    }

    fn fail(&self, error: io::Error) -> CloseReason {
        let cause = Arc::new(io::Error::new(error.kind(), error.to_string()));
        self.correlator.on_connection_error(&self.id, error);
        CloseReason::Failed(cause)
    }
}
