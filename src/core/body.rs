use bytes::Bytes;
use serde::Serialize;

use crate::core::error::Error;

pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
pub(crate) const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub(crate) const APPLICATION_JSON: &str = "application/json";
pub(crate) const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Largest slice handed to a lifecycle in one `send_request_data` call.
pub(crate) const SEND_CHUNK_SIZE: usize = 64 * 1024;

/// In-memory body with a read position.
#[derive(Clone, Debug)]
pub(crate) struct BufferedCursor {
    data: Bytes,
    position: usize,
}

impl BufferedCursor {
    pub(crate) fn new(data: Bytes) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn read(&mut self, max: usize) -> Bytes {
        let end = self
            .position
            .saturating_add(max.max(1))
            .min(self.data.len());
        let chunk = self.data.slice(self.position..end);
        self.position = end;
        chunk
    }

    pub(crate) fn rewind(&mut self) {
        self.position = 0;
    }
}

/// Splits at most `max` bytes off the front of `pending`.
pub(crate) fn take_pending(pending: &mut Bytes, max: usize) -> Bytes {
    let take = pending.len().min(max.max(1));
    pending.split_to(take)
}

pub(crate) fn json_bytes<T>(value: &T) -> crate::Result<Bytes>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| Error::Serialize { source })
}

pub(crate) fn form_bytes<I, K, V>(pairs: I) -> Bytes
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        serializer.append_pair(name.as_ref(), value.as_ref());
    }
    Bytes::from(serializer.finish())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{BufferedCursor, form_bytes, take_pending};

    #[test]
    fn cursor_reads_in_bounded_slices_and_rewinds() {
        let mut cursor = BufferedCursor::new(Bytes::from_static(b"abcdefg"));
        assert_eq!(cursor.read(3), "abc");
        assert_eq!(cursor.read(3), "def");
        assert_eq!(cursor.read(3), "g");
        assert!(cursor.read(3).is_empty());

        cursor.rewind();
        assert_eq!(cursor.read(16), "abcdefg");
    }

    #[test]
    fn pending_is_split_from_the_front() {
        let mut pending = Bytes::from_static(b"hello");
        assert_eq!(take_pending(&mut pending, 2), "he");
        assert_eq!(pending, "llo");
    }

    #[test]
    fn form_pairs_are_urlencoded() {
        let encoded = form_bytes([("name", "a b"), ("tag", "x&y")]);
        assert_eq!(encoded, "name=a+b&tag=x%26y");
    }
}
