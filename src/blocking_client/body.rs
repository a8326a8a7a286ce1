use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use serde::Serialize;

use crate::core::body::{
    APPLICATION_JSON, BufferedCursor, FORM_URLENCODED, OCTET_STREAM, TEXT_PLAIN, form_bytes,
    json_bytes, take_pending,
};
use crate::core::error::Error;
use crate::core::request::{BodyShape, RequestHead};

trait SeekableRead: Read + Seek + Send {}

impl<T: Read + Seek + Send> SeekableRead for T {}

type ChunkIter = Box<dyn Iterator<Item = io::Result<Bytes>> + Send>;

enum Source {
    Empty,
    Buffered(BufferedCursor),
    Reader {
        reader: Box<dyn Read + Send>,
        length: Option<u64>,
    },
    Chunks {
        chunks: ChunkIter,
        pending: Bytes,
    },
    Seekable {
        reader: Box<dyn SeekableRead>,
        start: u64,
        length: Option<u64>,
    },
}

/// Request body for the blocking session.
///
/// Buffered and seekable bodies can be replayed for retries and redirects;
/// readers and chunk iterators are consumed once.
pub struct RequestData {
    source: Source,
    content_type: Option<&'static str>,
    touched: bool,
}

impl std::fmt::Debug for RequestData {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.source {
            Source::Empty => "empty",
            Source::Buffered(_) => "buffered",
            Source::Reader { .. } => "reader",
            Source::Chunks { .. } => "chunks",
            Source::Seekable { .. } => "seekable",
        };
        formatter
            .debug_struct("RequestData")
            .field("kind", &kind)
            .field("content_length", &self.content_length())
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl Default for RequestData {
    fn default() -> Self {
        Self::empty()
    }
}

impl RequestData {
    pub fn empty() -> Self {
        Self {
            source: Source::Empty,
            content_type: None,
            touched: false,
        }
    }

    pub fn bytes(data: impl Into<Bytes>) -> Self {
        Self {
            source: Source::Buffered(BufferedCursor::new(data.into())),
            content_type: Some(OCTET_STREAM),
            touched: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            source: Source::Buffered(BufferedCursor::new(Bytes::from(text.into()))),
            content_type: Some(TEXT_PLAIN),
            touched: false,
        }
    }

    pub fn json<T>(value: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            source: Source::Buffered(BufferedCursor::new(json_bytes(value)?)),
            content_type: Some(APPLICATION_JSON),
            touched: false,
        })
    }

    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self {
            source: Source::Buffered(BufferedCursor::new(form_bytes(pairs))),
            content_type: Some(FORM_URLENCODED),
            touched: false,
        }
    }

    /// One-shot reader of unknown length, sent chunked.
    pub fn reader<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            source: Source::Reader {
                reader: Box::new(reader),
                length: None,
            },
            content_type: Some(OCTET_STREAM),
            touched: false,
        }
    }

    pub fn reader_with_length<R>(reader: R, length: u64) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            source: Source::Reader {
                reader: Box::new(reader),
                length: Some(length),
            },
            content_type: Some(OCTET_STREAM),
            touched: false,
        }
    }

    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Bytes>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            source: Source::Chunks {
                chunks: Box::new(chunks.into_iter()),
                pending: Bytes::new(),
            },
            content_type: Some(OCTET_STREAM),
            touched: false,
        }
    }

    /// Seekable source sent from its current position. Rewinding seeks back
    /// to that position; the length is measured up front.
    pub fn seekable<R>(mut reader: R) -> io::Result<Self>
    where
        R: Read + Seek + Send + 'static,
    {
        let start = reader.stream_position()?;
        let end = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(start))?;
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

    pub fn file(file: File) -> io::Result<Self> {
        Self::seekable(file)
    }

    /// Overrides the `Content-Type` applied when the request sets none.
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
            Source::Reader { length, .. } | Source::Seekable { length, .. } => *length,
            Source::Chunks { .. } => None,
        }
    }

    pub fn is_rewindable(&self) -> bool {
        matches!(
            self.source,
            Source::Empty | Source::Buffered(_) | Source::Seekable { .. }
        )
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
    pub fn read(&mut self, max: usize) -> io::Result<Bytes> {
        let max = max.max(1);
        self.touched = true;
        match &mut self.source {
            Source::Empty => Ok(Bytes::new()),
            Source::Buffered(cursor) => Ok(cursor.read(max)),
            Source::Reader { reader, .. } => read_up_to(reader.as_mut(), max),
            Source::Seekable { reader, .. } => read_up_to(reader.as_mut(), max),
            Source::Chunks { chunks, pending } => {
                while pending.is_empty() {
                    match chunks.next() {
                        Some(chunk) => *pending = chunk?,
                        None => return Ok(Bytes::new()),
                    }
                }
                Ok(take_pending(pending, max))
            }
        }
    }

    /// Returns to the first byte. One-shot sources report `Unsupported`.
    pub fn rewind(&mut self) -> io::Result<()> {
        let rewound = match &mut self.source {
            Source::Empty => Ok(()),
            Source::Buffered(cursor) => {
                cursor.rewind();
                Ok(())
            }
            Source::Seekable { reader, start, .. } => {
                reader.seek(SeekFrom::Start(*start)).map(drop)
            }
            Source::Reader { .. } | Source::Chunks { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "streamed request body cannot be replayed",
            )),
        };
        if rewound.is_ok() {
            self.touched = false;
        }
        rewound
    }

    /// Whether any byte has been pulled since construction or the last rewind.
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Puts the body back at its first byte before a resend. A body that was
    /// never read is already there, even when it is one-shot.
    pub(crate) fn rewind_for(&mut self, request: &RequestHead) -> crate::Result<()> {
        if !self.touched {
            return Ok(());
        }
        self.rewind().map_err(|_| Error::UnrewindableBody {
            method: request.method().clone(),
            uri: request.url().to_string(),
        })
    }
}

fn read_up_to(reader: &mut (impl Read + ?Sized), max: usize) -> io::Result<Bytes> {
    let mut buffer = vec![0_u8; max];
    loop {
        match reader.read(&mut buffer) {
            Ok(read) => {
                buffer.truncate(read);
                return Ok(Bytes::from(buffer));
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
}

impl From<Bytes> for RequestData {
    fn from(data: Bytes) -> Self {
        Self::bytes(data)
    }
}

impl From<Vec<u8>> for RequestData {
    fn from(data: Vec<u8>) -> Self {
        Self::bytes(data)
    }
}

impl From<&'static [u8]> for RequestData {
    fn from(data: &'static [u8]) -> Self {
        Self::bytes(data)
    }
}

impl From<String> for RequestData {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&'static str> for RequestData {
    fn from(text: &'static str) -> Self {
        Self::text(text)
    }
}
