//! `MailSender` against a scripted SMTP server on a local socket.

#![allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]

use std::time::Duration;

use postwire_core::{Credentials, Envelope, MailSender, Security, SenderConfig, SmtpError};
use postwire_smtp::{MessageContent, SessionConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self::new(stream)
    }

    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn reply(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
    }

    async fn expect(&mut self, expected: &str) {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end_matches("\r\n"), expected);
    }

    async fn read_data(&mut self) -> String {
        let mut data = String::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            if line == ".\r\n" {
                return data;
            }
            data.push_str(&line);
        }
    }

    async fn handshake(&mut self, extensions: &str) {
        self.reply("220 mx.test ESMTP\r\n").await;
        self.expect("EHLO client.test").await;
        self.reply(&format!("250-mx.test\r\n{extensions}")).await;
    }

    async fn transaction(&mut self, from: &str, to: &str) -> String {
        self.expect(&format!("MAIL FROM:<{from}>")).await;
        self.reply("250 OK\r\n").await;
        self.expect(&format!("RCPT TO:<{to}>")).await;
        self.reply("250 OK\r\n").await;
        self.expect("DATA").await;
        self.reply("354 Go ahead\r\n").await;
        let data = self.read_data().await;
        self.reply("250 Queued\r\n").await;
        data
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postwire_core=debug,postwire_smtp=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn config(port: u16) -> SenderConfig {
    init_tracing();
    let session = SessionConfig::builder("127.0.0.1").port(port).build();
    SenderConfig::new(session, "client.test").security(Security::None)
}

fn envelope() -> Envelope {
    Envelope::new("a@x.com").to("b@y.com")
}

#[tokio::test]
async fn test_send_with_password_auth() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 AUTH PLAIN LOGIN\r\n").await;
        peer.expect("AUTH PLAIN dXNlcgB1c2VyAHBhc3M=").await;
        peer.reply("235 2.7.0 Accepted\r\n").await;
        let data = peer.transaction("a@x.com", "b@y.com").await;
        peer.expect("QUIT").await;
        peer.reply("221 Bye\r\n").await;
        data
    });

    let sender = MailSender::new(config(port).credentials(Credentials::Password {
        username: "user".into(),
        password: "pass".into(),
    }));
    let replies = sender
        .send(&envelope(), MessageContent::from("Subject: Hi\r\n\r\nHello"))
        .await
        .unwrap();
    assert_eq!(replies.len(), 4);
    assert!(sender.is_connected().await);

    sender.close().await;
    assert!(!sender.is_connected().await);
    assert_eq!(server.await.unwrap(), "Subject: Hi\r\n\r\nHello\r\n");
}

#[tokio::test]
async fn test_login_used_without_plain() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 AUTH LOGIN\r\n").await;
        peer.expect("AUTH LOGIN dXNlcg==").await;
        peer.reply("334 UGFzc3dvcmQ6\r\n").await;
        peer.expect("cGFzcw==").await;
        peer.reply("535 5.7.8 Bad credentials\r\n").await;
        peer
    });

    let sender = MailSender::new(config(port).credentials(Credentials::Password {
        username: "user".into(),
        password: "pass".into(),
    }));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::Authentication(ref message) if message.contains("535")));
    assert!(!sender.is_connected().await);
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_session_is_reused() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 8BITMIME\r\n").await;
        peer.transaction("a@x.com", "b@y.com").await;

        peer.expect("RSET").await;
        peer.expect("MAIL FROM:<a@x.com>").await;
        peer.reply("250 Flushed\r\n250 OK\r\n").await;
        peer.expect("RCPT TO:<b@y.com>").await;
        peer.reply("250 OK\r\n").await;
        peer.expect("DATA").await;
        peer.reply("354 Go ahead\r\n").await;
        peer.read_data().await;
        peer.reply("250 Queued\r\n").await;
        peer
    });

    let sender = MailSender::new(config(port));
    sender.send(&envelope(), MessageContent::from("one")).await.unwrap();
    let replies = sender.send(&envelope(), MessageContent::from("two")).await.unwrap();
    assert_eq!(replies.len(), 5);
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let (listener, port) = listener().await;
    let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let mut first = Peer::accept(&listener).await;
        first.handshake("250 8BITMIME\r\n").await;
        first.transaction("a@x.com", "b@y.com").await;
        drop(first);
        dropped_tx.send(()).unwrap();

        let mut second = Peer::accept(&listener).await;
        second.handshake("250 8BITMIME\r\n").await;
        // A fresh session starts without RSET.
        second.transaction("a@x.com", "b@y.com").await;
        second
    });

    let sender = MailSender::new(config(port));
    sender.send(&envelope(), MessageContent::from("one")).await.unwrap();

    dropped_rx.await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while sender.is_connected().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let replies = sender.send(&envelope(), MessageContent::from("two")).await.unwrap();
    assert_eq!(replies.len(), 4);
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_rejected_sender() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 SIZE 1000\r\n").await;
        peer.expect("MAIL FROM:<a@x.com>").await;
        peer.reply("550 5.7.1 Sender denied\r\n").await;
        peer
    });

    let sender = MailSender::new(config(port));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    match err {
        SmtpError::Rejected { code, message } => {
            assert_eq!(code, 550);
            assert_eq!(message, "5.7.1 Sender denied");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The session survives a rejected transaction.
    assert!(sender.is_connected().await);
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_response_timeout_drops_session() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 8BITMIME\r\n").await;
        peer.expect("MAIL FROM:<a@x.com>").await;
        peer
    });

    init_tracing();
    let session = SessionConfig::builder("127.0.0.1")
        .port(port)
        .response_timeout(Some(Duration::from_millis(200)))
        .build();
    let sender = MailSender::new(SenderConfig::new(session, "client.test").security(Security::None));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::Connection(ref message) if message.contains("Timed out")));
    assert!(!sender.is_connected().await);
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_starttls_required_but_missing() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.handshake("250 PIPELINING\r\n").await;
        peer
    });

    let sender = MailSender::new(config(port).security(Security::StartTls));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::UnsupportedSecurity(_)));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_refused_greeting() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let mut peer = Peer::accept(&listener).await;
        peer.reply("554 5.3.2 Not accepting mail\r\n").await;
        peer
    });

    let sender = MailSender::new(config(port).max_reconnect_attempts(0));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::Connection(ref message) if message.contains("554")));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn test_connection_refused_after_retries() {
    let (listener, port) = listener().await;
    drop(listener);

    let sender = MailSender::new(config(port).max_reconnect_attempts(1));
    let err = sender
        .send(&envelope(), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::Connection(_)));
    assert!(!sender.is_connected().await);
}

#[tokio::test]
async fn test_invalid_envelope_does_not_connect() {
    let sender = MailSender::new(config(1));
    let err = sender
        .send(&Envelope::new("a@x.com"), MessageContent::from("body"))
        .await
        .unwrap_err();
    assert!(matches!(err, SmtpError::InvalidAddress(_)));
}
