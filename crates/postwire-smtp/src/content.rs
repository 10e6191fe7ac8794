//! Message content with a declared transfer encoding.
//!
//! Content is immutable and cheap to clone. It is sent either dot-stuffed
//! after DATA or as raw bytes after BDAT; see [`MessageContent::dot_stuffed_view`]
//! and [`MessageContent::chunk_view`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::BoxFuture;
use crate::codec::Frame;

/// Read size used when scanning or streaming a lazy source.
const READ_CHUNK: usize = 16 * 1024;

/// Declared transfer encoding of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    /// Only 7-bit octets are expected.
    #[default]
    SevenBit,
    /// Octets above 127 may appear.
    EightBit,
}

/// Reader handed out by a [`ByteSource`].
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// A re-readable source of message bytes with a known length.
///
/// Used for large messages that should not be buffered in memory. The
/// source may be opened more than once, for example to count non-ASCII
/// octets before sending.
pub trait ByteSource: fmt::Debug + Send + Sync {
    /// Total number of bytes the reader yields.
    fn size(&self) -> u64;

    /// Opens a fresh reader positioned at the first byte.
    fn open(&self) -> BoxFuture<'_, io::Result<SourceReader>>;
}

/// A file on disk used as message content.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Creates a source for `path`, reading its length once.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub async fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> BoxFuture<'_, io::Result<SourceReader>> {
        Box::pin(async move {
            let file = tokio::fs::File::open(&self.path).await?;
            Ok(Box::new(file) as SourceReader)
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Body {
    Memory(Bytes),
    Source(Arc<dyn ByteSource>),
}

/// Message bytes plus their declared encoding.
#[derive(Debug, Clone)]
pub struct MessageContent {
    body: Body,
    encoding: ContentEncoding,
}

impl MessageContent {
    /// Wraps an in-memory message.
    pub fn new(bytes: impl Into<Bytes>, encoding: ContentEncoding) -> Self {
        Self {
            body: Body::Memory(bytes.into()),
            encoding,
        }
    }

    /// Wraps a lazily-read source.
    pub fn from_source(source: impl ByteSource + 'static, encoding: ContentEncoding) -> Self {
        Self {
            body: Body::Source(Arc::new(source)),
            encoding,
        }
    }

    /// Wraps a file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub async fn from_file(path: impl AsRef<Path>, encoding: ContentEncoding) -> io::Result<Self> {
        Ok(Self::from_source(FileSource::new(path).await?, encoding))
    }

    /// Size in bytes before dot-stuffing.
    #[must_use]
    pub fn size(&self) -> u64 {
        match &self.body {
            Body::Memory(bytes) => bytes.len() as u64,
            Body::Source(source) => source.size(),
        }
    }

    /// Declared encoding.
    #[must_use]
    pub const fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    /// Counts octets above 127. Reads a lazy source to the end.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    pub async fn count_non_ascii_octets(&self) -> io::Result<u64> {
        match &self.body {
            Body::Memory(bytes) => Ok(count_non_ascii(bytes)),
            Body::Source(source) => {
                let mut reader = source.open().await?;
                let mut buf = vec![0; READ_CHUNK];
                let mut count = 0;
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(count);
                    }
                    count += count_non_ascii(&buf[..n]);
                }
            }
        }
    }

    /// Frames for the DATA path: the dot-stuffed body, then the end marker.
    #[must_use]
    pub fn dot_stuffed_view(&self) -> [Frame; 2] {
        [Frame::Content(self.clone()), Frame::EndOfContent]
    }

    /// Frame for the BDAT path: the body unchanged.
    #[must_use]
    pub fn chunk_view(&self) -> Frame {
        Frame::Raw(self.clone())
    }

    pub(crate) const fn body(&self) -> &Body {
        &self.body
    }
}

impl From<&'static str> for MessageContent {
    fn from(text: &'static str) -> Self {
        Self::new(text, ContentEncoding::SevenBit)
    }
}

impl From<Vec<u8>> for MessageContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes, ContentEncoding::SevenBit)
    }
}

fn count_non_ascii(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|b| !b.is_ascii()).count() as u64
}

/// Streaming dot-stuffer for the DATA path.
///
/// Every line that begins with `.` gets a second `.`, and a CRLF is added
/// when the content does not end with one. Empty content stays empty.
#[derive(Debug, Clone)]
pub struct DotStuffer {
    line_start: bool,
    tail: [u8; 2],
    written: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DotStuffer {
    /// Creates a stuffer positioned at the start of a line.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            line_start: true,
            tail: [0; 2],
            written: false,
        }
    }

    /// Stuffs `input`, appending to `out`.
    pub fn stuff(&mut self, input: &[u8], out: &mut BytesMut) {
        out.reserve(input.len() + 2);
        let mut from = 0;
        for (i, &b) in input.iter().enumerate() {
            if self.line_start && b == b'.' {
                out.put_slice(&input[from..i]);
                out.put_u8(b'.');
                from = i;
            }
            self.line_start = b == b'\n';
        }
        out.put_slice(&input[from..]);

        match input {
            [] => {}
            [only] => self.tail = [self.tail[1], *only],
            [.., a, b] => self.tail = [*a, *b],
        }
        self.written |= !input.is_empty();
    }

    /// Terminates the content with CRLF if needed.
    pub fn finish(self, out: &mut BytesMut) {
        if self.written && self.tail != *b"\r\n" {
            out.put_slice(b"\r\n");
        }
    }
}

/// Dot-stuffs a complete in-memory body.
#[must_use]
pub fn dot_stuff(input: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(input.len() + 8);
    let mut stuffer = DotStuffer::new();
    stuffer.stuff(input, &mut out);
    stuffer.finish(&mut out);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn unstuff(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut line_start = true;
        for &b in input {
            if line_start && b == b'.' {
                line_start = false;
                continue;
            }
            out.push(b);
            line_start = b == b'\n';
        }
        out
    }

    #[derive(Debug)]
    struct SliceSource(&'static [u8]);

    impl ByteSource for SliceSource {
        fn size(&self) -> u64 {
            self.0.len() as u64
        }

        fn open(&self) -> BoxFuture<'_, io::Result<SourceReader>> {
            Box::pin(async move { Ok(Box::new(self.0) as SourceReader) })
        }
    }

    #[test]
    fn test_leading_dots_are_doubled() {
        let out = dot_stuff(b".hidden\r\nnormal\r\n..two\r\n");
        assert_eq!(&out[..], b"..hidden\r\nnormal\r\n...two\r\n");
    }

    #[test]
    fn test_dots_inside_lines_are_untouched() {
        let out = dot_stuff(b"a.b\r\nend.\r\n");
        assert_eq!(&out[..], b"a.b\r\nend.\r\n");
    }

    #[test]
    fn test_missing_crlf_is_appended() {
        assert_eq!(&dot_stuff(b"Hello")[..], b"Hello\r\n");
        assert_eq!(&dot_stuff(b"Hello\r\n")[..], b"Hello\r\n");
    }

    #[test]
    fn test_empty_content_stays_empty() {
        assert!(dot_stuff(b"").is_empty());
    }

    #[test]
    fn test_stuffing_across_chunk_boundaries() {
        let mut out = BytesMut::new();
        let mut stuffer = DotStuffer::new();
        stuffer.stuff(b"line\r", &mut out);
        stuffer.stuff(b"\n", &mut out);
        stuffer.stuff(b".dot\r\n", &mut out);
        stuffer.stuff(b"x", &mut out);
        stuffer.finish(&mut out);
        assert_eq!(&out[..], b"line\r\n..dot\r\nx\r\n");
    }

    #[test]
    fn test_crlf_split_across_chunks_is_not_doubled() {
        let mut out = BytesMut::new();
        let mut stuffer = DotStuffer::new();
        stuffer.stuff(b"abc\r", &mut out);
        stuffer.stuff(b"\n", &mut out);
        stuffer.finish(&mut out);
        assert_eq!(&out[..], b"abc\r\n");
    }

    #[test]
    fn test_size_and_encoding() {
        let content = MessageContent::new("héllo", ContentEncoding::EightBit);
        assert_eq!(content.size(), 6);
        assert_eq!(content.encoding(), ContentEncoding::EightBit);
        assert_eq!(MessageContent::from("x").encoding(), ContentEncoding::SevenBit);
    }

    #[tokio::test]
    async fn test_count_non_ascii_in_memory() {
        let content = MessageContent::new("héllo wörld", ContentEncoding::EightBit);
        assert_eq!(content.count_non_ascii_octets().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_count_non_ascii_from_source() {
        let content = MessageContent::from_source(
            SliceSource("plain ascii\r\n".as_bytes()),
            ContentEncoding::EightBit,
        );
        assert_eq!(content.size(), 13);
        assert_eq!(content.count_non_ascii_octets().await.unwrap(), 0);
    }

    #[test]
    fn test_views() {
        let content = MessageContent::from("Hello");
        let [body, end] = content.dot_stuffed_view();
        assert!(matches!(body, Frame::Content(_)));
        assert!(matches!(end, Frame::EndOfContent));
        assert!(matches!(content.chunk_view(), Frame::Raw(_)));
    }

    proptest! {
        #[test]
        fn stuffing_round_trips(lines in prop::collection::vec("[.a-z ]{0,12}", 0..10)) {
            let body: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            let stuffed = dot_stuff(body.as_bytes());
            prop_assert_eq!(unstuff(&stuffed), body.as_bytes().to_vec());
            // No stuffed line may be a lone "." terminator.
            prop_assert!(!stuffed.starts_with(b".\r\n"));
            let text = String::from_utf8(stuffed.to_vec()).unwrap();
            prop_assert!(!text.contains("\r\n.\r\n"));
        }
    }
}
