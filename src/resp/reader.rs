//! Framed RESP reader over any async byte stream.
//!
//! Bytes are accumulated in a pooled read buffer until
//! [`resp_frame_len`] finds one complete frame, which is then split off
//! and frozen so bulk payloads can be sliced out without copying.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::resp::charset::Charset;
use crate::resp::parser::{parse, resp_frame_len};
use crate::resp::pool::{read_buffers, Pooled, READ_BUFFER_CAPACITY};
use crate::resp::types::RespValue;

/// Default maximum read buffer size (512 MB).
pub const DEFAULT_MAX_BUF_SIZE: usize = 512 * 1024 * 1024;

/// Minimum free space before a socket read.
const MIN_READ_SPACE: usize = 4096;

pub struct ResponseReader<R> {
    inner: R,
    buf: Pooled<'static>,
    max_buf_size: usize,
    charset: Charset,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(inner: R, charset: Charset) -> Self {
        Self::with_max_buf(inner, charset, DEFAULT_MAX_BUF_SIZE)
    }

    pub fn with_max_buf(inner: R, charset: Charset, max_buf_size: usize) -> Self {
        Self {
            inner,
            buf: read_buffers().get(),
            max_buf_size,
            charset,
        }
    }

    /// Read one complete frame and decode it.
    ///
    /// Error frames come back as [`RespValue::Error`]. A `Decode` error
    /// consumes its frame, so the stream stays usable; `Protocol` and
    /// `Connection` errors do not.
    pub async fn read_value(&mut self) -> Result<RespValue> {
        loop {
            if !self.buf.is_empty() {
                match resp_frame_len(&self.buf) {
                    Ok(len) => {
                        let frame = self.buf.split_to(len).freeze();
                        let (value, _) = parse(&frame, self.charset)?;
                        return Ok(value);
                    }
                    Err(Error::Incomplete) => {}
                    Err(e) => return Err(e),
                }
            }
            self.fill().await?;
        }
    }

    /// Read one reply, turning a top-level error frame into
    /// [`Error::Redis`].
    ///
    /// Unlike a top-level error, error frames nested inside arrays (e.g.
    /// the per-command results of `EXEC`) are not raised. They come back
    /// as [`RespValue::Error`] elements, and callers must check for them.
    pub async fn read_message(&mut self) -> Result<RespValue> {
        match self.read_value().await? {
            RespValue::Error(msg) => Err(Error::redis(msg)),
            value => Ok(value),
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    async fn fill(&mut self) -> Result<()> {
        if self.buf.capacity() - self.buf.len() < MIN_READ_SPACE {
            let target = (self.buf.capacity() * 2).max(READ_BUFFER_CAPACITY);
            if self.buf.len() >= self.max_buf_size {
                return Err(Error::Protocol(format!(
                    "RESP message too large: buffer would exceed {} bytes",
                    self.max_buf_size
                )));
            }
            let target = target.min(self.max_buf_size);
            let additional = target.saturating_sub(self.buf.len()).max(MIN_READ_SPACE);
            self.buf.reserve(additional);
        }
        let n = self.inner.read_buf(&mut *self.buf).await?;
        if n == 0 {
            return Err(Error::from(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let data: &[u8] = b"+OK\r\n:4711\r\n$9\r\nsome text\r\n";
        let mut reader = ResponseReader::new(data, Charset::Utf8);

        assert_eq!(reader.read_value().await.unwrap(), RespValue::SimpleString("OK".into()));
        assert_eq!(reader.read_value().await.unwrap(), RespValue::Integer(4711));
        assert_eq!(
            reader.read_value().await.unwrap(),
            RespValue::BulkString(Bytes::from_static(b"some text"))
        );
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn frames_split_across_reads() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = ResponseReader::new(rx, Charset::Utf8);

        let writer = tokio::spawn(async move {
            for chunk in [&b"*2\r\n$3\r\nfo"[..], b"o\r\n", b":1", b"\r\n"] {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let value = reader.read_value().await.unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from_static(b"foo")),
                RespValue::Integer(1),
            ])
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn decode_error_skips_only_its_frame() {
        let data: &[u8] = b":471a\r\n+OK\r\n";
        let mut reader = ResponseReader::new(data, Charset::Utf8);

        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(reader.read_value().await.unwrap(), RespValue::SimpleString("OK".into()));
    }

    #[tokio::test]
    async fn only_top_level_error_frames_fail() {
        let data: &[u8] = b"-ERR boom\r\n*2\r\n+OK\r\n-ERR inner\r\n";
        let mut reader = ResponseReader::new(data, Charset::Utf8);

        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Redis { .. }), "{err:?}");
        assert_eq!(
            reader.read_message().await.unwrap(),
            RespValue::Array(vec![
                RespValue::SimpleString("OK".into()),
                RespValue::Error("ERR inner".into()),
            ])
        );
    }

    #[tokio::test]
    async fn protocol_error_is_fatal() {
        let data: &[u8] = b"?garbage\r\n";
        let mut reader = ResponseReader::new(data, Charset::Utf8);
        let err = reader.read_value().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn eof_is_connection_error() {
        let data: &[u8] = b"$5\r\nhel";
        let mut reader = ResponseReader::new(data, Charset::Utf8);
        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn top_level_error_becomes_redis_error() {
        let data: &[u8] = b"-WRONGTYPE bad\r\n*1\r\n-ERR nested\r\n";
        let mut reader = ResponseReader::new(data, Charset::Utf8);

        let err = reader.read_message().await.unwrap_err();
        assert_eq!(err.redis_kind(), Some(&crate::error::RedisErrorKind::WrongType));

        let nested = reader.read_message().await.unwrap();
        assert_eq!(nested, RespValue::Array(vec![RespValue::Error("ERR nested".into())]));
    }

    #[tokio::test]
    async fn oversized_reply_rejected() {
        let mut data = b"$100000\r\n".to_vec();
        data.extend(std::iter::repeat(b'x').take(100_000));
        data.extend_from_slice(b"\r\n");
        let mut reader = ResponseReader::with_max_buf(&data[..], Charset::Utf8, 16 * 1024);

        let err = reader.read_value().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn large_bulk_grows_buffer() {
        let payload = vec![b'z'; 200_000];
        let mut data = format!("${}\r\n", payload.len()).into_bytes();
        data.extend_from_slice(&payload);
        data.extend_from_slice(b"\r\n");
        let mut reader = ResponseReader::new(&data[..], Charset::Utf8);

        match reader.read_value().await.unwrap() {
            RespValue::BulkString(b) => assert_eq!(b.len(), payload.len()),
            other => panic!("expected bulk, got {other:?}"),
        }
    }
}
