//! Matches inbound replies to the command group waiting for them.
//!
//! One [`Correlator`] is shared by every connection created from a
//! [`SessionFactory`](crate::SessionFactory). Each connection has at most
//! one pending collector. Replies arrive in request order because a
//! connection is driven by a single I/O task, so no tagging is needed.
//!
//! A collector completes exactly once: with all expected replies, or with a
//! timeout, close or transport failure. Whichever path removes it from the
//! table first wins and the rest become no-ops.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, RandomState};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::types::Reply;

const SHARDS: usize = 16;

/// Identity of one connection, used as the correlation key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// Creates an id from any string.
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// Receives connection errors that arrive while nothing is pending.
pub type ErrorHandler = Arc<dyn Fn(&ConnectionId, &io::Error) + Send + Sync>;

type Describe = Box<dyn Fn() -> String + Send>;
type Completion = oneshot::Sender<Result<Vec<Reply>>>;

struct Collector {
    expected: usize,
    replies: Vec<Reply>,
    describe: Describe,
    done: Completion,
    timeout: Option<JoinHandle<()>>,
    generation: u64,
}

impl Collector {
    fn finish(mut self, result: Result<Vec<Reply>>) {
        if let Some(timeout) = self.timeout.take() {
            timeout.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.done.send(result);
    }
}

struct Inner {
    shards: Box<[Mutex<HashMap<ConnectionId, Collector>>]>,
    hasher: RandomState,
    default_timeout: Option<Duration>,
    error_handler: Option<ErrorHandler>,
    generation: AtomicU64,
}

impl Inner {
    fn shard(&self, id: &ConnectionId) -> MutexGuard<'_, HashMap<ConnectionId, Collector>> {
        let index = usize::try_from(self.hasher.hash_one(id) % SHARDS as u64).unwrap_or_default();
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: &ConnectionId) -> Option<Collector> {
        self.shard(id).remove(id)
    }

    fn remove_generation(&self, id: &ConnectionId, generation: u64) -> Option<Collector> {
        let mut shard = self.shard(id);
        if shard.get(id).is_some_and(|c| c.generation == generation) {
            shard.remove(id)
        } else {
            None
        }
    }
}

/// Shared reply correlation table.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("default_timeout", &self.inner.default_timeout)
            .field("error_handler", &self.inner.error_handler.is_some())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    /// Creates a correlator with a default response timeout and an optional
    /// handler for errors on idle connections.
    #[must_use]
    pub fn new(default_timeout: Option<Duration>, error_handler: Option<ErrorHandler>) -> Self {
        let shards = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                shards,
                hasher: RandomState::new(),
                default_timeout,
                error_handler,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a wait for `expected` replies on `id`.
    ///
    /// `timeout` overrides the default; with neither, the wait only ends
    /// with the replies or the connection. `describe` is rendered lazily for
    /// timeout errors and diagnostics.
    ///
    /// Must be called from within a tokio runtime when a timeout applies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUsage`] if `expected` is zero or a group is
    /// already pending on this connection.
    pub fn create_response_future<F>(
        &self,
        id: &ConnectionId,
        expected: usize,
        timeout: Option<Duration>,
        describe: F,
    ) -> Result<ResponseFuture>
    where
        F: Fn() -> String + Send + 'static,
    {
        if expected == 0 {
            return Err(Error::usage(format!(
                "Cannot wait for zero responses to [{}]",
                describe()
            )));
        }

        let mut shard = self.inner.shard(id);
        if let Some(pending) = shard.get(id) {
            return Err(Error::usage(format!(
                "Cannot wait for a response to [{}] because we're still waiting for a response to [{}]",
                describe(),
                (pending.describe)()
            )));
        }

        let (done, rx) = oneshot::channel();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let timeout = timeout
            .or(self.inner.default_timeout)
            .map(|after| spawn_timeout(Arc::downgrade(&self.inner), id.clone(), generation, after));

        shard.insert(
            id.clone(),
            Collector {
                expected,
                replies: Vec::with_capacity(expected),
                describe: Box::new(describe),
                done,
                timeout,
                generation,
            },
        );

        Ok(ResponseFuture {
            rx,
            connection_id: id.clone(),
        })
    }

    /// Delivers one reply read from `id`.
    ///
    /// Replies with nothing pending are logged and dropped.
    pub fn on_response(&self, id: &ConnectionId, reply: Reply) {
        let complete = {
            let mut shard = self.inner.shard(id);
            let Some(collector) = shard.get_mut(id) else {
                tracing::warn!(connection = %id, %reply, "Unexpected response");
                return;
            };
            tracing::trace!(connection = %id, code = reply.code.as_u16(), "Response");
            collector.replies.push(reply);
            if collector.replies.len() >= collector.expected {
                shard.remove(id)
            } else {
                None
            }
        };

        if let Some(mut collector) = complete {
            let replies = std::mem::take(&mut collector.replies);
            collector.finish(Ok(replies));
        }
    }

    /// Reports an I/O failure on `id`.
    ///
    /// A pending wait fails with [`Error::Transport`]. Otherwise the error
    /// goes to the configured handler, or is logged when there is none.
    pub fn on_connection_error(&self, id: &ConnectionId, cause: io::Error) {
        if let Some(collector) = self.inner.remove(id) {
            let description = (collector.describe)();
            collector.finish(Err(Error::Transport {
                connection_id: id.clone(),
                description,
                source: Arc::new(cause),
            }));
        } else if let Some(handler) = &self.inner.error_handler {
            handler(id, &cause);
        } else {
            tracing::error!(connection = %id, error = %cause, "Unhandled connection error");
        }
    }

    /// Reports that `id` has closed. A pending wait fails with
    /// [`Error::ConnectionClosed`] and the slot is freed.
    pub fn on_connection_closed(&self, id: &ConnectionId) {
        if let Some(collector) = self.inner.remove(id) {
            let description = (collector.describe)();
            collector.finish(Err(Error::ConnectionClosed {
                connection_id: id.clone(),
                description,
            }));
        }
    }

    /// Describes what `id` is waiting for, if anything.
    #[must_use]
    pub fn pending_description(&self, id: &ConnectionId) -> Option<String> {
        self.inner.shard(id).get(id).map(|c| (c.describe)())
    }

    /// Returns true if a group is pending on `id`.
    #[must_use]
    pub fn is_pending(&self, id: &ConnectionId) -> bool {
        self.inner.shard(id).contains_key(id)
    }
}

fn spawn_timeout(
    inner: Weak<Inner>,
    id: ConnectionId,
    generation: u64,
    after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Some(mut collector) = inner.remove_generation(&id, generation) {
            // Detach rather than abort our own handle.
            collector.timeout.take();
            let description = (collector.describe)();
            tracing::warn!(connection = %id, %description, ?after, "Response timeout");
            collector.finish(Err(Error::ResponseTimeout {
                connection_id: id,
                description,
            }));
        }
    })
}

/// Resolves to the replies of one command group, in arrival order.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Vec<Reply>>>,
    connection_id: ConnectionId,
}

impl ResponseFuture {
    /// Connection the wait belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Vec<Reply>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Error::ConnectionClosed {
                    connection_id: this.connection_id.clone(),
                    description: "correlator dropped".into(),
                })
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_pending, assert_ready};

    fn reply(code: u16, text: &str) -> Reply {
        Reply::new(ReplyCode::new(code), vec![text.to_string()])
    }

    fn id(s: &str) -> ConnectionId {
        ConnectionId::new(s)
    }

    #[tokio::test]
    async fn test_replies_resolve_in_arrival_order() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let future = correlator
            .create_response_future(&conn, 3, None, || "MAIL, RCPT, DATA".into())
            .unwrap();

        correlator.on_response(&conn, reply(250, "first"));
        correlator.on_response(&conn, reply(550, "second"));
        correlator.on_response(&conn, reply(354, "third"));

        let replies = future.await.unwrap();
        let codes: Vec<u16> = replies.iter().map(|r| r.code.as_u16()).collect();
        assert_eq!(codes, vec![250, 550, 354]);
        assert!(!correlator.is_pending(&conn));
    }

    #[tokio::test]
    async fn test_fewer_replies_leave_future_pending() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let mut future = tokio_test::task::spawn(
            correlator
                .create_response_future(&conn, 2, None, || "NOOP, NOOP".into())
                .unwrap(),
        );

        correlator.on_response(&conn, reply(250, "one"));
        assert_pending!(future.poll());
        assert_eq!(
            correlator.pending_description(&conn).as_deref(),
            Some("NOOP, NOOP")
        );

        correlator.on_response(&conn, reply(250, "two"));
        assert!(future.is_woken());
        let replies = assert_ready!(future.poll()).unwrap();
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_without_reply() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let start = tokio::time::Instant::now();
        let future = correlator
            .create_response_future(&conn, 1, Some(Duration::from_millis(200)), || {
                "NOOP".into()
            })
            .unwrap();

        let err = future.await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(
            err.to_string(),
            "[c1] Timed out waiting for a response to [NOOP]"
        );
        assert!(!correlator.is_pending(&conn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_timeout_wins() {
        let correlator = Correlator::new(Some(Duration::from_millis(200)), None);
        let conn = id("c1");
        let future = correlator
            .create_response_future(&conn, 1, None, || "NOOP".into())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        correlator.on_response(&conn, reply(250, "ok"));
        assert!(future.await.is_ok());

        // A stale timer must not touch the next wait.
        let next = correlator
            .create_response_future(&conn, 1, Some(Duration::from_secs(10)), || "RSET".into())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(correlator.is_pending(&conn));
        correlator.on_response(&conn, reply(250, "ok"));
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_second_wait_on_same_connection_is_rejected() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let _first = correlator
            .create_response_future(&conn, 1, None, || "old".into())
            .unwrap();

        let err = correlator
            .create_response_future(&conn, 1, None, || "new".into())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid usage: Cannot wait for a response to [new] because we're still waiting for a response to [old]"
        );
    }

    #[tokio::test]
    async fn test_zero_expected_is_rejected() {
        let correlator = Correlator::new(None, None);
        assert!(
            correlator
                .create_response_future(&id("c1"), 0, None, String::new)
                .unwrap_err()
                .is_usage_error()
        );
    }

    #[tokio::test]
    async fn test_connection_closed_fails_and_frees_slot() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let future = correlator
            .create_response_future(&conn, 1, None, || "DATA".into())
            .unwrap();

        correlator.on_connection_closed(&conn);
        let err = future.await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { ref description, .. } if description == "DATA"));

        assert!(
            correlator
                .create_response_future(&conn, 1, None, || "NOOP".into())
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_connection_error_fails_pending_wait() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        let future = correlator
            .create_response_future(&conn, 1, None, || "QUIT".into())
            .unwrap();

        correlator.on_connection_error(&conn, io::Error::from(io::ErrorKind::BrokenPipe));
        let err = future.await.unwrap_err();
        assert!(matches!(err, Error::Transport { ref source, .. } if source.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_idle_connection_error_goes_to_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler: ErrorHandler = Arc::new(move |conn, err| {
            assert_eq!(conn.as_str(), "c1");
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let correlator = Correlator::new(None, Some(handler));

        correlator.on_connection_error(&id("c1"), io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_dropped() {
        let correlator = Correlator::new(None, None);
        let conn = id("c1");
        correlator.on_response(&conn, reply(421, "shutting down"));
        assert!(!correlator.is_pending(&conn));
        assert_eq!(correlator.pending_description(&conn), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connections_are_independent() {
        let correlator = Correlator::new(Some(Duration::from_secs(5)), None);
        let mut tasks = Vec::new();

        for n in 0..64 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let conn = ConnectionId::new(format!("conn-{n}"));
                for round in 0..10u16 {
                    let future = correlator
                        .create_response_future(&conn, 2, None, || "MAIL, RCPT".into())
                        .unwrap();
                    correlator.on_response(&conn, reply(250, "a"));
                    correlator.on_response(&conn, reply(251 + round % 2, "b"));
                    let replies = future.await.unwrap();
                    assert_eq!(replies.len(), 2);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }
    }
}
