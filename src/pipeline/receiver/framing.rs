//! Exact-count reads and frame extraction for media connections

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FramingError, StreamError};

/// Size of the big-endian length prefix on timestamped frames
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Separator between the ASCII timestamp and the payload
pub const TIMESTAMP_DELIMITER: u8 = b'|';
/// Largest buffer growth per read
pub const READ_CHUNK: usize = 64 * 1024;

/// Result of an exact-count read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Peer closed after `received` bytes of the requested count
    Closed { received: usize },
}

/// Reads whole frames off a byte stream
pub struct FramedReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed from the connection
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read exactly `n` bytes, or report how far we got before the peer closed
    ///
    /// The buffer grows at most [`READ_CHUNK`] bytes per read, so a declared
    /// length only costs memory once its bytes actually arrive.
    pub async fn read_exact(&mut self, n: usize) -> Result<ReadOutcome, StreamError> {
        let mut buf = BytesMut::with_capacity(n.min(READ_CHUNK));
        while buf.len() < n {
            let remaining = n - buf.len();
            buf.reserve(remaining.min(READ_CHUNK));
            let mut limited = (&mut self.inner).take(remaining as u64);
            let read = match limited.read_buf(&mut buf).await {
                Ok(read) => read,
                Err(e) => match StreamError::from(e) {
                    StreamError::ConnectionClosed => 0,
                    other => return Err(other),
                },
            };
            if read == 0 {
                let received = buf.len();
                self.bytes_read += received as u64;
                return Ok(ReadOutcome::Closed { received });
            }
        }
        self.bytes_read += n as u64;
        Ok(ReadOutcome::Data(buf.freeze()))
    }

    /// Read a fixed-size stream header
    ///
    /// A close before the first byte is `ConnectionClosed`, a close part way
    /// through is a truncated header.
    pub async fn read_header(&mut self, len: usize) -> Result<Bytes, StreamError> {
        match self.read_exact(len).await? {
            ReadOutcome::Data(bytes) => Ok(bytes),
            ReadOutcome::Closed { received: 0 } => Err(StreamError::ConnectionClosed),
            ReadOutcome::Closed { received } => Err(FramingError::TruncatedHeader {
                expected: len,
                received,
            }
            .into()),
        }
    }

    /// Read one `u32` big-endian length-prefixed frame
    ///
    /// Returns `Ok(None)` on a clean close at a frame boundary.
    pub async fn read_length_prefixed(
        &mut self,
        max_frame_len: usize,
    ) -> Result<Option<Bytes>, StreamError> {
        let prefix = match self.read_exact(LENGTH_PREFIX_LEN).await? {
            ReadOutcome::Data(bytes) => bytes,
            ReadOutcome::Closed { received: 0 } => return Ok(None),
            ReadOutcome::Closed { received } => {
                return Err(FramingError::TruncatedHeader {
                    expected: LENGTH_PREFIX_LEN,
                    received,
                }
                .into());
            }
        };

        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len == 0 {
            return Err(FramingError::ZeroLength.into());
        }
        if len > max_frame_len {
            return Err(StreamError::protocol(format!(
                "frame length {len} exceeds the {max_frame_len} byte limit"
            )));
        }

        match self.read_exact(len).await? {
            ReadOutcome::Data(body) => Ok(Some(body)),
            ReadOutcome::Closed { received } => Err(FramingError::TruncatedBody {
                expected: len,
                received,
            }
            .into()),
        }
    }
}

/// Split `"<ascii-float>|<payload>"` on the first delimiter
pub fn split_timestamped(frame: Bytes) -> Result<(f64, Bytes), FramingError> {
    let at = frame
        .iter()
        .position(|b| *b == TIMESTAMP_DELIMITER)
        .ok_or(FramingError::MissingDelimiter)?;

    let text = std::str::from_utf8(&frame[..at])
        .map_err(|_| FramingError::BadTimestamp(String::from_utf8_lossy(&frame[..at]).into()))?;
    let timestamp: f64 = text
        .trim()
        .parse()
        .map_err(|_| FramingError::BadTimestamp(text.to_string()))?;
    if !timestamp.is_finite() {
        return Err(FramingError::BadTimestamp(text.to_string()));
    }

    Ok((timestamp, frame.slice(at + 1..)))
}

/// Encode a timestamped frame, as a sender would
#[cfg(test)]
pub fn encode_timestamped(timestamp: f64, payload: &[u8]) -> Vec<u8> {
    let stamp = timestamp.to_string();
    let len = stamp.len() + 1 + payload.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_LEN + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.extend_from_slice(stamp.as_bytes());
    out.push(TIMESTAMP_DELIMITER);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_exact_across_partial_writes() {
        let (mut tx, rx) = tokio::io::duplex(4);
        let mut reader = FramedReader::new(rx);

        let writer = tokio::spawn(async move {
            tx.write_all(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).await.unwrap();
        });

        let outcome = reader.read_exact(10).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Data(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10])));
        writer.await.unwrap();

        // Writer dropped: clean close at the boundary
        assert_eq!(reader.read_exact(3).await.unwrap(), ReadOutcome::Closed { received: 0 });
        assert_eq!(reader.bytes_read(), 10);
    }

    #[tokio::test]
    async fn test_partial_read_then_close() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&[0u8; 5]).await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx);
        assert_eq!(reader.read_exact(12).await.unwrap(), ReadOutcome::Closed { received: 5 });
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&[0u8; 7]).await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx);
        let err = reader.read_header(12).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Framing(FramingError::TruncatedHeader {
                expected: 12,
                received: 7
            })
        ));
    }

    #[tokio::test]
    async fn test_length_prefixed_frames() {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(&encode_timestamped(1.25, b"abc")).await.unwrap();
        tx.write_all(&0u32.to_be_bytes()).await.unwrap();
        tx.write_all(&encode_timestamped(1.5, b"de")).await.unwrap();
        tx.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx);
        let frame = reader.read_length_prefixed(1024).await.unwrap().unwrap();
        assert_eq!(split_timestamped(frame).unwrap(), (1.25, Bytes::from_static(b"abc")));

        let err = reader.read_length_prefixed(1024).await.unwrap_err();
        assert!(err.is_recoverable());

        // The zero-length frame consumed only its prefix
        let frame = reader.read_length_prefixed(1024).await.unwrap().unwrap();
        assert_eq!(split_timestamped(frame).unwrap().0, 1.5);

        let err = reader.read_length_prefixed(1024).await.unwrap_err();
        assert!(matches!(err, StreamError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(&10u32.to_be_bytes()).await.unwrap();
        tx.write_all(b"1.0|x").await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx);
        let err = reader.read_length_prefixed(64).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Framing(FramingError::TruncatedBody {
                expected: 10,
                received: 5
            })
        ));
        assert!(reader.read_length_prefixed(64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_large_frame_read_in_chunks() {
        let len = 3 * READ_CHUNK + 17;
        let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let (mut tx, rx) = tokio::io::duplex(8 * 1024);
        let sent = body.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&(len as u32).to_be_bytes()).await.unwrap();
            tx.write_all(&sent).await.unwrap();
        });

        let mut reader = FramedReader::new(rx);
        let frame = reader.read_length_prefixed(len).await.unwrap().unwrap();
        assert_eq!(frame, Bytes::from(body));
        assert_eq!(reader.bytes_read(), (LENGTH_PREFIX_LEN + len) as u64);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_huge_declared_length_then_close() {
        let declared = 64 * 1024 * 1024;
        let (mut tx, rx) = tokio::io::duplex(1024);
        tx.write_all(&(declared as u32).to_be_bytes()).await.unwrap();
        tx.write_all(&[7u8; 100]).await.unwrap();
        drop(tx);

        let mut reader = FramedReader::new(rx);
        let err = reader.read_length_prefixed(declared).await.unwrap_err();
        assert!(matches!(
            err,
            StreamError::Framing(FramingError::TruncatedBody {
                expected,
                received: 100
            }) if expected == declared
        ));
        assert_eq!(reader.bytes_read(), (LENGTH_PREFIX_LEN + 100) as u64);
    }

    #[test]
    fn test_split_timestamped() {
        let (ts, payload) = split_timestamped(Bytes::from_static(b" 1700000000.125 |a|b")).unwrap();
        assert_eq!(ts, 1_700_000_000.125);
        assert_eq!(payload, Bytes::from_static(b"a|b"));

        assert_eq!(
            split_timestamped(Bytes::from_static(b"no delimiter")),
            Err(FramingError::MissingDelimiter)
        );
        assert!(matches!(
            split_timestamped(Bytes::from_static(b"abc|x")),
            Err(FramingError::BadTimestamp(_))
        ));
        assert!(matches!(
            split_timestamped(Bytes::from_static(b"inf|x")),
            Err(FramingError::BadTimestamp(_))
        ));
        assert!(matches!(
            split_timestamped(Bytes::from_static(b"NaN|x")),
            Err(FramingError::BadTimestamp(_))
        ));
    }
}
