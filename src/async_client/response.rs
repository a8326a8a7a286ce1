use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use crate::core::body::take_pending;
use crate::core::pipeline::{BodyPipeline, ResponseMeta};
use crate::core::request::RequestHead;
use crate::core::response::{HistoryEntry, ResponseHead, TextEncoding};

use super::transport::AsyncLifecycle;

const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

enum Source {
    Live(Box<dyn AsyncLifecycle>),
    Cached(Bytes),
    Drained,
}

/// A final response from the async session; the body is pulled on demand.
pub struct AsyncResponse {
    meta: ResponseMeta,
    pipeline: BodyPipeline,
    source: Source,
}

impl std::fmt::Debug for AsyncResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AsyncResponse")
            .field("status", &self.meta.head.status())
            .field("version", &self.meta.head.version())
            .field("headers", self.meta.head.headers())
            .field("history", &self.meta.history.len())
            .finish_non_exhaustive()
    }
}

impl AsyncResponse {
    pub(super) fn streaming(
        head: ResponseHead,
        history: Vec<HistoryEntry>,
        pipeline: BodyPipeline,
        lifecycle: Box<dyn AsyncLifecycle>,
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

    pub fn request(&self) -> &RequestHead {
        self.pipeline.request()
    }

    pub fn url(&self) -> &Url {
        self.meta.head.url()
    }

    pub fn head(&self) -> &ResponseHead {
        &self.meta.head
    }

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

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.meta.trailers.as_ref()
    }

    pub fn raise_for_status(self) -> crate::Result<Self> {
        self.meta.head.raise_for_status()?;
        Ok(self)
    }

    pub async fn chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        let result = self.next_chunk(max.max(1)).await;
        if result.is_err() {
            self.release();
        }
        result
    }

    /// Decoded body chunks as a stream.
    pub fn chunks(&mut self, max: usize) -> impl Stream<Item = crate::Result<Bytes>> + Send + '_ {
        futures_util::stream::unfold(Some(self), move |response| async move {
            let response = response?;
            match response.chunk(max).await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(response))),
                Ok(None) => None,
                Err(error) => Some((Err(error), None)),
            }
        })
    }

    /// Body text as a stream, decoded with the response's encoding.
    pub fn text_chunks(
        &mut self,
        max: usize,
    ) -> impl Stream<Item = crate::Result<String>> + Send + '_ {
        let decoder = self.meta.text_decoder();
        futures_util::stream::unfold(
            Some((self, decoder)),
            move |state| async move {
                let (response, mut decoder) = state?;
                loop {
                    match response.chunk(max).await {
                        Ok(Some(chunk)) => {
                            let text = decoder.decode(&chunk, false);
                            if !text.is_empty() {
                                return Some((Ok(text), Some((response, decoder))));
                            }
                        }
                        Ok(None) => {
                            let text = decoder.decode(&[], true);
                            return (!text.is_empty()).then(|| (Ok(text), None));
                        }
                        Err(error) => return Some((Err(error), None)),
                    }
                }
            },
        )
    }

    pub async fn data(&mut self) -> crate::Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk(DEFAULT_CHUNK_SIZE).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub async fn text(&mut self) -> crate::Result<String> {
        let body = self.data().await?;
        Ok(self.meta.decode_text(&body))
    }

    pub async fn json<T>(mut self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        let body = self.data().await?;
        self.meta.decode_json(&body)
    }

    pub fn close(&mut self) {
        self.pipeline.abandon();
        self.release();
    }

    async fn next_chunk(&mut self, max: usize) -> crate::Result<Option<Bytes>> {
        loop {
            if matches!(self.source, Source::Drained) {
                return Ok(None);
            }
            self.pipeline.check()?;
            let raw = match &mut self.source {
                Source::Live(lifecycle) => lifecycle.receive_response_data(max).await?,
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

impl Drop for AsyncResponse {
    fn drop(&mut self) {
        if !self.pipeline.is_finished() {
            self.pipeline.abandon();
        }
        self.release();
    }
}
