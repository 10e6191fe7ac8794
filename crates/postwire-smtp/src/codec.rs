//! Outbound framing: commands, message content and the end-of-data marker.
//!
//! The encoder tracks whether DATA has opened a content section. Content
//! frames are only valid inside such a section, and [`Frame::EndOfContent`]
//! closes it by writing the lone `.` line.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::content::{Body, DotStuffer, MessageContent};

const WRITE_CHUNK: usize = 16 * 1024;

/// One unit written to the connection.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A command line.
    Command(Command),
    /// Message body, dot-stuffed on the way out.
    Content(MessageContent),
    /// Message body written unchanged, as BDAT requires.
    Raw(MessageContent),
    /// Terminates the DATA section with `.\r\n`.
    EndOfContent,
}

impl Frame {
    /// Log-safe description; credentials and message bodies are hidden.
    #[must_use]
    pub fn describe(&self) -> Option<String> {
        match self {
            Self::Command(command) => Some(command.describe()),
            Self::Content(_) | Self::Raw(_) => Some("[CONTENT]".to_string()),
            Self::EndOfContent => None,
        }
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

/// Joins frame descriptions for diagnostics, e.g. `MAIL FROM:<a@x>, RCPT TO:<b@y>`.
#[must_use]
pub fn describe_frames(frames: &[Frame]) -> String {
    frames
        .iter()
        .filter_map(Frame::describe)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stateful encoder for outbound frames.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    content_expected: bool,
}

impl RequestEncoder {
    /// Creates an encoder outside any content section.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            content_expected: false,
        }
    }

    /// Returns true between DATA and the end-of-content marker.
    #[must_use]
    pub const fn is_content_expected(&self) -> bool {
        self.content_expected
    }

    /// Writes `frames` to `io` and flushes once.
    ///
    /// In-memory content is encoded into one buffer with the surrounding
    /// commands. Lazy sources are streamed in chunks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for content outside a DATA section, or any
    /// error from the writer or a content source.
    pub async fn write_frames<W>(&mut self, frames: &[Frame], io: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = BytesMut::with_capacity(WRITE_CHUNK);

        for frame in frames {
            match frame {
                Frame::Command(command) => {
                    // Any command after DATA means the server refused it.
                    self.content_expected = command.opens_content();
                    let mut line = Vec::with_capacity(64);
                    command.write_to(&mut line);
                    buf.extend_from_slice(&line);
                }
                Frame::Content(content) => {
                    self.expect_content("message content")?;
                    let mut stuffer = DotStuffer::new();
                    match content.body() {
                        Body::Memory(bytes) => stuffer.stuff(bytes, &mut buf),
                        Body::Source(source) => {
                            let mut reader = source.open().await?;
                            let mut chunk = vec![0; WRITE_CHUNK];
                            loop {
                                let n = reader.read(&mut chunk).await?;
                                if n == 0 {
                                    break;
                                }
                                stuffer.stuff(&chunk[..n], &mut buf);
                                if buf.len() >= WRITE_CHUNK {
                                    io.write_all(&buf).await?;
                                    buf.clear();
                                }
                            }
                        }
                    }
                    stuffer.finish(&mut buf);
                }
                Frame::Raw(content) => match content.body() {
                    Body::Memory(bytes) => buf.extend_from_slice(bytes),
                    Body::Source(source) => {
                        io.write_all(&buf).await?;
                        buf.clear();
                        let mut reader = source.open().await?;
                        tokio::io::copy(&mut reader, io).await?;
                    }
                },
                Frame::EndOfContent => {
                    self.expect_content("end of content marker")?;
                    buf.extend_from_slice(b".\r\n");
                    self.content_expected = false;
                }
            }
        }

        io.write_all(&buf).await?;
        io.flush().await
    }

    fn expect_content(&self, what: &str) -> io::Result<()> {
        if self.content_expected {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{what} written outside a DATA section"),
            ))
        }
    }
}
