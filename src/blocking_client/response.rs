use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::core::body::take_pending;
use crate::core::pipeline::{BodyPipeline, ResponseMeta};
use crate::core::request::RequestHead;
use crate::core::response::{HistoryEntry, ResponseHead, TextDecoder, TextEncoding};

use super::transport::Lifecycle;

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

enum Source {
    Live(Box<dyn Lifecycle>),
    Cached(Bytes),
    Drained,
}

/// A final response whose body has not been read yet.
///
/// The body is pulled from the connection on demand, decoded according to
/// `Content-Encoding`, and written to the response cache once it has been
/// read to the end. Dropping an unread response closes its connection.
pub struct Response {
    meta: ResponseMeta,
    pipeline: BodyPipeline,
    source: Source,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.meta.head.status())
            .field("version", &self.meta.head.version())
            .field("headers", self.meta.head.headers())
            .field("history", &self.meta.history.len())
            .finish_non_exhaustive()
    }
}

impl Response {
    pub(super) fn streaming(
        head: ResponseHead,
        history: Vec<HistoryEntry>,
        pipeline: BodyPipeline,
        lifecycle: Box<dyn Lifecycle>,
    ) -> Self {
        Self {
            meta: ResponseMeta::new(head, history),
            pipeline,
            source: Source::Live(lifecycle),
        }
    }

    pub(super) fn cached(
        head: ResponseHead,
        history: Vec<HistoryEntry>,
        pipeline: BodyPipeline,
        body: Bytes,
    ) -> Self {
        Self {
            meta: ResponseMeta::new(head, history),
            pipeline,
            source: Source::Cached(body),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.meta.head.status()
    }

    pub fn version(&self) -> Version {
        self.meta.head.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.meta.head.headers()
    }

    /// The request as it was sent for this response, after redirects.
    pub fn request(&self) -> &RequestHead {
        self.pipeline.request()
    }

    pub fn url(&self) -> &Url {
        self.meta.head.url()
    }

    pub fn head(&self) -> &ResponseHead {
        &self.meta.head
    }

    /// Redirect responses and failed attempts that preceded this one.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.meta.history
    }

    pub fn content_type(&self) -> String {
        self.meta.content_type()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.meta.content_length()
    }

    pub fn encoding(&self) -> TextEncoding {
        self.meta.encoding()
    }

    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        self.meta.encoding = Some(encoding);
    }

    /// Available once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.meta.trailers.as_ref()
    }

    pub fn raise_for_status(self) -> crate::Result<Self> {
        self.meta.head.raise_for_status()?;
        Ok(self)
    }

    /// Next decoded body chunk of at most roughly `max` bytes, or `None` at
    /// the end of the body.
    pub fn chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        let result = self.next_chunk(max.max(1));
        if result.is_err() {
            self.release();
        }
        result
    }

    pub fn chunks(&mut self, max: usize) -> ResponseChunks<'_> {
        ResponseChunks {
            response: self,
            max,
        }
    }

    pub fn text_chunks(&mut self, max: usize) -> TextChunks<'_> {
        let decoder = self.meta.text_decoder();
        TextChunks {
            response: self,
            decoder,
            max,
            done: false,
        }
    }

    /// Reads the remaining body into memory.
    pub fn data(&mut self) -> crate::Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk(DEFAULT_CHUNK_SIZE)? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub fn text(&mut self) -> crate::Result<String> {
        let body = self.data()?;
        Ok(self.meta.decode_text(&body))
    }

    pub fn json<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.data()?;
        self.meta.decode_json(&body)
    }

    /// Closes the connection without reading the rest of the body. Nothing
    /// is written to the response cache.
    pub fn close(&mut self) {
        self.pipeline.abandon();
        self.release();
    }

    fn next_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        loop {
            if matches!(self.source, Source::Drained) {
                return Ok(None);
            }
            self.pipeline.check()?;
            let raw = match &mut self.source {
                Source::Live(lifecycle) => lifecycle.receive_response_data(max)?,
                Source::Cached(pending) => take_pending(pending, max),
                Source::Drained => Bytes::new(),
            };
            if raw.is_empty() {
                let tail = self.pipeline.finish()?;
                if let Source::Live(lifecycle) = &self.source {
                    self.meta.trailers = lifecycle.response_trailers();
                }
                self.release();
                return Ok((!tail.is_empty()).then_some(tail));
            }
            let decoded = self.pipeline.push(&raw)?;
            if !decoded.is_empty() {
                return Ok(Some(decoded));
            }
        }
    }

    fn release(&mut self) {
        if let Source::Live(mut lifecycle) = std::mem::replace(&mut self.source, Source::Drained) {
            lifecycle.close();
        }
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if !self.pipeline.is_finished() {
            self.pipeline.abandon();
        }
        self.release();
    }
}

/// Iterator over decoded body chunks.
pub struct ResponseChunks<'a> {
    response: &'a mut Response,
    max: usize,
}

impl Iterator for ResponseChunks<'_> {
    type Item = crate::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.response.chunk(self.max).transpose()
    }
}

/// Iterator over body text, decoded with the response's encoding.
pub struct TextChunks<'a> {
    response: &'a mut Response,
    decoder: TextDecoder,
    max: usize,
    done: bool,
}

impl Iterator for TextChunks<'_> {
    type Item = crate::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.response.chunk(self.max) {
                Ok(Some(chunk)) => {
                    let text = self.decoder.decode(&chunk, false);
                    if !text.is_empty() {
                        return Some(Ok(text));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    let text = self.decoder.decode(&[], true);
                    if !text.is_empty() {
                        return Some(Ok(text));
                    }
                }
                Err(error) => {
                    self.done = true;
                    return Some(Err(error));
                }
            }
        }
        None
    }
}
