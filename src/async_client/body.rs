use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::core::body::{
    APPLICATION_JSON, BufferedCursor, FORM_URLENCODED, OCTET_STREAM, TEXT_PLAIN, form_bytes,
    json_bytes, take_pending,
};
use crate::core::error::Error;
use crate::core::request::{BodyShape, RequestHead};

trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

enum Source {
    Empty,
    Buffered(BufferedCursor),
    Stream {
        stream: ChunkStream,
        pending: Bytes,
        length: Option<u64>,
    },
    Seekable {
        reader: Box<dyn SeekableRead>,
        start: u64,
        length: Option<u64>,
    },
}

/// Request body for the async session.
pub struct AsyncRequestData {
    source: Source,
    content_type: Option<&'static str>,
    touched: bool,
}

impl std::fmt::Debug for AsyncRequestData {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.source {
            Source::Empty => "empty",
            Source::Buffered(_) => "buffered",
            Source::Stream { .. } => "stream",
            Source::Seekable { .. } => "seekable",
        };
        formatter
            .debug_struct("AsyncRequestData")
            .field("kind", &kind)
            .field("content_length", &self.content_length())
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl Default for AsyncRequestData {
    fn default() -> Self {
        Self::empty()
    }
}

impl AsyncRequestData {
    pub fn empty() -> Self {
        Self {
            source: Source::Empty,
            content_type: None,
            touched: false,
        }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self::buffered(data.into(), OCTET_STREAM)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::buffered(Bytes::from(text.into()), TEXT_PLAIN)
    }

    pub fn json<T>(value: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self::buffered(json_bytes(value)?, APPLICATION_JSON))
    }

    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::buffered(form_bytes(pairs), FORM_URLENCODED)
    }

    fn buffered(data: Bytes, content_type: &'static str) -> Self {
        Self {
            source: Source::Buffered(BufferedCursor::new(data)),
            content_type: Some(content_type),
            touched: false,
        }
    }

    /// One-shot stream of unknown length, sent chunked.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        Self::stream_with_length(stream, None)
    }

    pub fn stream_with_length<S, E>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let stream = stream.map(|item| item.map_err(io::Error::other));
        Self {
            source: Source::Stream {
                stream: Box::pin(stream),
                pending: Bytes::new(),
                length,
            },
            content_type: Some(OCTET_STREAM),
            touched: false,
        }
    }

    /// Seekable source sent from its current position.
    pub async fn seekable<R>(mut reader: R) -> io::Result<Self>
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        let start = reader.stream_position().await?;
        let end = reader.seek(io::SeekFrom::End(0)).await?;
        reader.seek(io::SeekFrom::Start(start)).await?;
        Ok(Self {
            source: Source::Seekable {
                reader: Box::new(reader),
                start,
                length: Some(end.saturating_sub(start)),
            },
            content_type: Some(OCTET_STREAM),
            touched: false,
        })
    }

    pub async fn file(file: tokio::fs::File) -> io::Result<Self> {
        Self::seekable(file).await
    }

    pub fn with_content_type(mut self, content_type: &'static str) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.source, Source::Empty)
    }

    pub fn content_length(&self) -> Option<u64> {
        match &self.source {
            Source::Empty => Some(0),
            Source::Buffered(cursor) => Some(cursor.len()),
            Source::Stream { length, .. } | Source::Seekable { length, .. } => *length,
        }
    }

    pub fn is_rewindable(&self) -> bool {
        !matches!(self.source, Source::Stream { .. })
    }

    pub fn shape(&self) -> BodyShape {
        if self.is_empty() {
            return BodyShape::empty();
        }
        BodyShape {
            present: true,
            content_length: self.content_length(),
            rewindable: self.is_rewindable(),
            content_type: self.content_type,
        }
    }

    /// Next chunk of at most `max` bytes; empty at end of body.
    pub async fn read(&mut self, max: usize) -> io::Result<Bytes> {
        let max = max.max(1);
        self.touched = true;
        match &mut self.source {
            Source::Empty => Ok(Bytes::new()),
            Source::Buffered(cursor) => Ok(cursor.read(max)),
            Source::Stream {
                stream, pending, ..
            } => {
                while pending.is_empty() {
                    match stream.next().await {
                        Some(chunk) => *pending = chunk?,
                        None => return Ok(Bytes::new()),
                    }
                }
                Ok(take_pending(pending, max))
            }
            Source::Seekable { reader, .. } => {
                let mut buffer = vec![0_u8; max];
                let read = reader.read(&mut buffer).await?;
                buffer.truncate(read);
                Ok(Bytes::from(buffer))
            }
        }
    }

    pub async fn rewind(&mut self) -> io::Result<()> {
        let rewound = match &mut self.source {
            Source::Empty => Ok(()),
            Source::Buffered(cursor) => {
                cursor.rewind();
                Ok(())
            }
            Source::Seekable { reader, start, .. } => {
                reader.seek(io::SeekFrom::Start(*start)).await.map(drop)
            }
            Source::Stream { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "streamed request body cannot be replayed",
            )),
        };
        if rewound.is_ok() {
            self.touched = false;
        }
        rewound
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// No-op for a body that has not been read since it was built or rewound.
    pub(crate) async fn rewind_for(&mut self, request: &RequestHead) -> crate::Result<()> {
        if !self.touched {
            return Ok(());
        }
        self.rewind()
            .await
            .map_err(|_| Error::UnrewindableBody {
                method: request.method().clone(),
                uri: request.url().to_string(),
            })
    }
}

impl From<Bytes> for AsyncRequestData {
    fn from(data: Bytes) -> Self {
        Self::bytes(data)
    }
}

impl From<Vec<u8>> for AsyncRequestData {
    fn from(data: Vec<u8>) -> Self {
        Self::bytes(data)
    }
}

impl From<String> for AsyncRequestData {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&'static str> for AsyncRequestData {
    fn from(text: &'static str) -> Self {
        Self::text(text)
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use bytes::Bytes;

    use super::AsyncRequestData;

    #[tokio::test]
    async fn buffered_body_replays_after_rewind() {
        let mut body = AsyncRequestData::form([("q", "rust lang")]);
        assert_eq!(
            body.shape().content_type,
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(body.read(64).await.expect("read"), "q=rust+lang");
        assert!(body.read(64).await.expect("read").is_empty());
        body.rewind().await.expect("buffered body should rewind");
        assert_eq!(body.read(1).await.expect("read"), "q");
    }

    #[tokio::test]
    async fn stream_body_is_chunked_and_one_shot() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![Ok(Bytes::from_static(b"abc"))];
        let mut body = AsyncRequestData::stream(futures_util::stream::iter(chunks));
        let shape = body.shape();
        assert_eq!(shape.content_length, None);
        assert!(!shape.rewindable);
        assert_eq!(body.read(2).await.expect("read"), "ab");
        assert_eq!(body.read(2).await.expect("read"), "c");
        assert!(body.rewind().await.is_err());
    }

    #[tokio::test]
    async fn file_body_measures_remaining_length() {
        let path = tempfile::NamedTempFile::new().expect("tempfile should open");
        std::fs::write(path.path(), b"0123456789").expect("write should succeed");
        let file = tokio::fs::File::open(path.path())
            .await
            .expect("file should open");
        let mut body = AsyncRequestData::file(file).await.expect("file body");
        assert_eq!(body.content_length(), Some(10));
        assert_eq!(body.read(4).await.expect("read"), "0123");
        body.rewind().await.expect("file should rewind");
        assert_eq!(body.read(4).await.expect("read"), "0123");
    }
}
