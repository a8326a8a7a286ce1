use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::core::cancel::CancelHandle;
use crate::core::content_encoding::{
    ContentDecoder, DecodeContentEncodingError, should_decode_content_encoded_body,
};
use crate::core::error::Error;
use crate::core::orchestrator::SessionCore;
use crate::core::request::RequestHead;
use crate::core::response::{
    HistoryEntry, ResponseHead, TextDecoder, TextEncoding, content_length, content_type,
    encoding_from_headers,
};
use crate::core::store::CachePlan;
use crate::core::util::truncate_body;

/// Header-side state of a delivered response, shared by both response types.
#[derive(Debug)]
pub(crate) struct ResponseMeta {
    pub(crate) head: ResponseHead,
    pub(crate) history: Vec<HistoryEntry>,
    pub(crate) encoding: Option<TextEncoding>,
    pub(crate) trailers: Option<HeaderMap>,
}

impl ResponseMeta {
    pub(crate) fn new(head: ResponseHead, history: Vec<HistoryEntry>) -> Self {
        Self {
            head,
            history,
            encoding: None,
            trailers: None,
        }
    }

    /// Caller override, then `charset`, then `ascii` for an empty body, then UTF-8.
    pub(crate) fn encoding(&self) -> TextEncoding {
        self.encoding
            .clone()
            .or_else(|| encoding_from_headers(self.head.headers()))
            .unwrap_or(TextEncoding::Utf8)
    }

    pub(crate) fn text_decoder(&self) -> TextDecoder {
        TextDecoder::new(self.encoding())
    }

    pub(crate) fn content_type(&self) -> String {
        content_type(self.head.headers())
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        content_length(self.head.headers())
    }

    pub(crate) fn decode_text(&self, body: &[u8]) -> String {
        self.text_decoder().decode(body, true)
    }

    pub(crate) fn decode_json<T: DeserializeOwned>(&self, body: &[u8]) -> crate::Result<T> {
        serde_json::from_slice(body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(body),
        })
    }
}

/// Decodes response bytes as they are pulled and tees them into the response
/// cache. The cache entry is written only when the stream reaches its end.
pub(crate) struct BodyPipeline {
    core: Arc<SessionCore>,
    request: Arc<RequestHead>,
    decoder: ContentDecoder,
    decode_error: Option<DecodeContentEncodingError>,
    cache: Option<(CachePlan, Vec<u8>)>,
    cancel: Option<CancelHandle>,
    finished: bool,
}

impl std::fmt::Debug for BodyPipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BodyPipeline")
            .field("decoder", &self.decoder)
            .field("caching", &self.cache.is_some())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl BodyPipeline {
    pub(crate) fn new(
        core: Arc<SessionCore>,
        head: &ResponseHead,
        cache: Option<CachePlan>,
        cancel: Option<CancelHandle>,
    ) -> Self {
        let request = Arc::clone(head.request_arc());
        let (decoder, decode_error) =
            if should_decode_content_encoded_body(request.method(), head.status()) {
                match ContentDecoder::from_headers(head.headers()) {
                    Ok(decoder) => (decoder, None),
                    Err(error) => (ContentDecoder::identity(), Some(error)),
                }
            } else {
                (ContentDecoder::identity(), None)
            };
        Self {
            core,
            request,
            decoder,
            decode_error,
            cache: cache.map(|plan| (plan, Vec::new())),
            cancel,
            finished: false,
        }
    }

    /// Pipeline for an already decoded body, such as a cache hit.
    pub(crate) fn decoded(core: Arc<SessionCore>, head: &ResponseHead) -> Self {
        Self {
            core,
            request: Arc::clone(head.request_arc()),
            decoder: ContentDecoder::identity(),
            decode_error: None,
            cache: None,
            cancel: None,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Fails on cancellation or an unsupported coding. Either discards the
    /// pending cache entry.
    pub(crate) fn check(&mut self) -> crate::Result<()> {
        if self.cancel.as_ref().is_some_and(CancelHandle::is_canceled) {
            self.abandon();
            return Err(Error::Canceled {
                method: self.request.method().clone(),
                uri: self.request.url().to_string(),
            });
        }
        if let Some(error) = self.decode_error.take() {
            self.abandon();
            return Err(self.decode_failure(error));
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, raw: &[u8]) -> crate::Result<Bytes> {
        let decoded = match self.decoder.decode(raw) {
            Ok(decoded) => decoded,
            Err(error) => {
                self.abandon();
                return Err(self.decode_failure(error));
            }
        };
        if let Some((_, buffer)) = &mut self.cache {
            buffer.extend_from_slice(&decoded);
        }
        Ok(decoded)
    }

    /// Flushes the decoder at end of stream and writes the cache entry.
    pub(crate) fn finish(&mut self) -> crate::Result<Bytes> {
        if self.finished {
            return Ok(Bytes::new());
        }
        self.finished = true;
        let tail = match self.decoder.finish() {
            Ok(tail) => tail,
            Err(error) => {
                self.abandon();
                return Err(self.decode_failure(error));
            }
        };
        if let Some((plan, mut buffer)) = self.cache.take() {
            buffer.extend_from_slice(&tail);
            self.core.store().store_cached_response(plan, buffer);
        }
        Ok(tail)
    }

    pub(crate) fn abandon(&mut self) {
        self.cache = None;
    }

    fn decode_failure(&self, error: DecodeContentEncodingError) -> Error {
        Error::DecodeContentEncoding {
            encoding: error.encoding,
            method: self.request.method().clone(),
            uri: self.request.url().to_string(),
            message: error.message,
        }
    }
}
