use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_ENCODING;
use http::{Method, StatusCode};

use crate::core::util::lock_unpoisoned;

const BROTLI_BUFFER_SIZE: usize = 4096;

#[derive(Debug)]
pub(crate) struct DecodeContentEncodingError {
    pub(crate) encoding: String,
    pub(crate) message: String,
}

impl DecodeContentEncodingError {
    fn new(encoding: &str, error: impl ToString) -> Self {
        Self {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        }
    }
}

pub(crate) fn should_decode_content_encoded_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Output buffer shared between a decoder stage and the code draining it.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock_unpoisoned(&self.0))
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Codec {
    Gzip(flate2::write::GzDecoder<Sink>),
    /// Undecided until the first two bytes show whether a zlib header is present.
    DeflatePending(Vec<u8>),
    Zlib(flate2::write::ZlibDecoder<Sink>),
    RawDeflate(flate2::write::DeflateDecoder<Sink>),
    Brotli(Box<brotli::DecompressorWriter<Sink>>),
    Zstd(zstd::stream::write::Decoder<'static, Sink>),
}

struct Stage {
    encoding: String,
    codec: Codec,
    sink: Sink,
}

impl Stage {
    fn new(encoding: &str) -> Result<Option<Self>, DecodeContentEncodingError> {
        let sink = Sink::default();
        let codec = match encoding.to_ascii_lowercase().as_str() {
            "identity" => return Ok(None),
            "gzip" | "x-gzip" => Codec::Gzip(flate2::write::GzDecoder::new(sink.clone())),
            "deflate" => Codec::DeflatePending(Vec::new()),
            "br" => Codec::Brotli(Box::new(brotli::DecompressorWriter::new(
                sink.clone(),
                BROTLI_BUFFER_SIZE,
            ))),
            "zstd" => Codec::Zstd(
                zstd::stream::write::Decoder::new(sink.clone())
                    .map_err(|error| DecodeContentEncodingError::new(encoding, error))?,
            ),
            other => {
                return Err(DecodeContentEncodingError::new(
                    other,
                    "unsupported content-encoding",
                ));
            }
        };
        Ok(Some(Self {
            encoding: encoding.to_owned(),
            codec,
            sink,
        }))
    }

    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, DecodeContentEncodingError> {
        if let Codec::DeflatePending(buffered) = &mut self.codec {
            buffered.extend_from_slice(input);
            if buffered.len() < 2 {
                return Ok(Vec::new());
            }
            let buffered = std::mem::take(buffered);
            self.decide_deflate(&buffered);
            return self.push(&buffered);
        }
        let result = match &mut self.codec {
            Codec::Gzip(decoder) => decoder.write_all(input).and_then(|()| decoder.flush()),
            Codec::Zlib(decoder) => decoder.write_all(input).and_then(|()| decoder.flush()),
            Codec::RawDeflate(decoder) => decoder.write_all(input).and_then(|()| decoder.flush()),
            Codec::Brotli(decoder) => decoder.write_all(input).and_then(|()| decoder.flush()),
            Codec::Zstd(decoder) => decoder.write_all(input).and_then(|()| decoder.flush()),
            Codec::DeflatePending(_) => Ok(()),
        };
        result.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        Ok(self.sink.take())
    }

    fn finish(&mut self) -> Result<Vec<u8>, DecodeContentEncodingError> {
        if let Codec::DeflatePending(buffered) = &mut self.codec {
            let buffered = std::mem::take(buffered);
            if buffered.is_empty() {
                return Ok(Vec::new());
            }
            self.decide_deflate(&buffered);
            let mut output = self.push(&buffered)?;
            output.extend(self.finish()?);
            return Ok(output);
        }
        let result = match &mut self.codec {
            Codec::Gzip(decoder) => decoder.try_finish(),
            Codec::Zlib(decoder) => decoder.try_finish(),
            Codec::RawDeflate(decoder) => decoder.try_finish(),
            Codec::Brotli(decoder) => decoder.flush(),
            Codec::Zstd(decoder) => decoder.flush(),
            Codec::DeflatePending(_) => Ok(()),
        };
        result.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        Ok(self.sink.take())
    }

    fn decide_deflate(&mut self, prefix: &[u8]) {
        let zlib_header = prefix.len() >= 2
            && prefix[0] & 0x0f == 8
            && (u16::from(prefix[0]) << 8 | u16::from(prefix[1])) % 31 == 0;
        self.codec = if zlib_header {
            Codec::Zlib(flate2::write::ZlibDecoder::new(self.sink.clone()))
        } else {
            Codec::RawDeflate(flate2::write::DeflateDecoder::new(self.sink.clone()))
        };
    }
}

/// Incremental `Content-Encoding` decoder, possibly several codings deep.
pub(crate) struct ContentDecoder {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encodings: Vec<&str> = self
            .stages
            .iter()
            .map(|stage| stage.encoding.as_str())
            .collect();
        formatter
            .debug_struct("ContentDecoder")
            .field("stages", &encodings)
            .finish()
    }
}

impl ContentDecoder {
    pub(crate) fn identity() -> Self {
        Self { stages: Vec::new() }
    }

    /// Codings are undone in reverse of the order they were listed.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Result<Self, DecodeContentEncodingError> {
        let mut listed = Vec::new();
        for value in headers.get_all(CONTENT_ENCODING) {
            let value = value
                .to_str()
                .map_err(|error| DecodeContentEncodingError::new("content-encoding", error))?;
            listed.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(ToOwned::to_owned),
            );
        }
        let mut stages = Vec::new();
        for encoding in listed.iter().rev() {
            if let Some(stage) = Stage::new(encoding)? {
                stages.push(stage);
            }
        }
        Ok(Self { stages })
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn decode(&mut self, chunk: &[u8]) -> Result<Bytes, DecodeContentEncodingError> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            if data.is_empty() {
                break;
            }
            data = stage.push(&data)?;
        }
        Ok(Bytes::from(data))
    }

    /// Flushes every stage once the encoded input is exhausted.
    pub(crate) fn finish(&mut self) -> Result<Bytes, DecodeContentEncodingError> {
        let mut carried = Vec::new();
        for stage in &mut self.stages {
            let mut output = if carried.is_empty() {
                Vec::new()
            } else {
                stage.push(&carried)?
            };
            output.extend(stage.finish()?);
            carried = output;
        }
        Ok(Bytes::from(carried))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use http::header::CONTENT_ENCODING;
    use http::{HeaderMap, HeaderValue};

    use super::ContentDecoder;

    fn decode_in_pieces(headers: &HeaderMap, encoded: &[u8], piece: usize) -> Vec<u8> {
        let mut decoder = ContentDecoder::from_headers(headers).expect("codings should be known");
        let mut output = Vec::new();
        for chunk in encoded.chunks(piece) {
            output.extend_from_slice(&decoder.decode(chunk).expect("chunk should decode"));
        }
        output.extend_from_slice(&decoder.finish().expect("stream should finish"));
        output
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).expect("gzip write should succeed");
        encoder.finish().expect("gzip finish should succeed")
    }

    #[test]
    fn gzip_decodes_across_small_chunks() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let plain = b"hello hello hello hello streaming world".repeat(20);
        let encoded = gzip(&plain);
        assert_eq!(decode_in_pieces(&headers, &encoded, 7), plain);
    }

    #[test]
    fn deflate_accepts_zlib_and_raw_streams() {
        let plain = b"deflate body".repeat(10);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("deflate"));

        let mut zlib = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        zlib.write_all(&plain).expect("zlib write should succeed");
        let zlib = zlib.finish().expect("zlib finish should succeed");
        assert_eq!(decode_in_pieces(&headers, &zlib, 1), plain);

        let mut raw = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::fast());
        raw.write_all(&plain).expect("deflate write should succeed");
        let raw = raw.finish().expect("deflate finish should succeed");
        assert_eq!(decode_in_pieces(&headers, &raw, 5), plain);
    }

    #[test]
    fn stacked_codings_are_undone_in_reverse() {
        let plain = b"stacked".repeat(30);
        let zstd_then_gzip = gzip(&zstd::stream::encode_all(&plain[..], 3).expect("zstd"));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd, gzip"));
        assert_eq!(decode_in_pieces(&headers, &zstd_then_gzip, 11), plain);
    }

    #[test]
    fn unknown_coding_is_rejected_up_front() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("compress"));
        let error = ContentDecoder::from_headers(&headers).expect_err("compress is unsupported");
        assert_eq!(error.encoding, "compress");

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("identity"));
        assert!(
            ContentDecoder::from_headers(&headers)
                .expect("identity is accepted")
                .is_identity()
        );
    }
}
