//! Frame reader for the LF-delimited link.
//!
//! Uses `bytes::BytesMut` to accumulate partial reads. Bytes arrive in
//! arbitrary chunks; every LF closes one frame and the remainder stays
//! buffered for the next chunk.
//!
//! # Example
//!
//! ```
//! use nixie_link::infrastructure::bluetooth::frame_reader::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! assert!(buffer.push(b"REQ_CH").is_empty());
//!
//! let frames = buffer.push(b"ECK_1\nCONN_PASS\n");
//! assert_eq!(frames.len(), 2);
//! assert_eq!(frames[0].to_text(), "REQ_CHECK_1");
//! ```

use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace, warn};

use super::protocol::{DEFAULT_MAX_FRAME_LEN, FRAME_DELIMITER};
use crate::domain::models::Frame;
use crate::error::{LinkError, Result};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 1024;

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    max_frame_len: usize,
    /// Dropping the rest of a line that already overflowed
    discarding: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Lines longer than `max_frame_len` are dropped whole.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_len.min(64 * 1024) + 1),
            max_frame_len,
            discarding: false,
        }
    }

    /// Push a chunk and extract every frame it completes.
    ///
    /// Zero-length frames (two LFs in a row) are returned as empty frames.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }

        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_frame_len {
            warn!(
                "Dropping oversized frame ({} bytes without delimiter, max {})",
                self.buffer.len(),
                self.max_frame_len
            );
            self.buffer.clear();
            self.discarding = true;
        }

        frames
    }

    /// Bytes held for an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == FRAME_DELIMITER)?;
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);

            if std::mem::take(&mut self.discarding) {
                // tail of an overflowed line
                continue;
            }
            if line.len() > self.max_frame_len {
                warn!(
                    "Dropping oversized frame ({} bytes, max {})",
                    line.len(),
                    self.max_frame_len
                );
                continue;
            }

            return Some(Frame::new(line.freeze()));
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy frame sequence over a byte source.
///
/// A read error is returned once as [`LinkError::Socket`]. After that, or
/// after end-of-stream, every call returns [`LinkError::ConnectionClosed`].
pub struct FrameReader<R> {
    source: R,
    buffer: FrameBuffer,
    pending: VecDeque<Frame>,
    chunk: Vec<u8>,
    closed: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_max_frame_len(source, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(source: R, max_frame_len: usize) -> Self {
        Self {
            source,
            buffer: FrameBuffer::with_max_frame_len(max_frame_len),
            pending: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK],
            closed: false,
        }
    }

    /// Wait for the next complete frame.
    pub async fn next_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            if self.closed {
                return Err(LinkError::ConnectionClosed);
            }

            match self.source.read(&mut self.chunk).await {
                Ok(0) => {
                    debug!("Stream ended ({} bytes unterminated)", self.buffer.pending_len());
                    self.closed = true;
                }
                Ok(n) => {
                    trace!("Read {} bytes", n);
                    let frames = self.buffer.push(&self.chunk[..n]);
                    self.pending.extend(frames);
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    self.closed = true;
                    return Err(LinkError::socket("read", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn texts(frames: &[Frame]) -> Vec<String> {
        frames.iter().map(Frame::to_text).collect()
    }

    #[test]
    fn test_split_across_chunks() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b"REQ_CH").is_empty());
        assert_eq!(buffer.pending_len(), 6);

        let frames = buffer.push(b"ECK_1\nCONN_PASS\n");
        assert_eq!(texts(&frames), vec!["REQ_CHECK_1", "CONN_PASS"]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_many_frames_one_chunk_with_remainder() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(b"a\nbb\n\nccc");
        assert_eq!(texts(&frames), vec!["a", "bb", ""]);
        assert_eq!(buffer.pending_len(), 3);

        let frames = buffer.push(b"\n");
        assert_eq!(texts(&frames), vec!["ccc"]);
    }

    #[test]
    fn test_oversized_line_dropped() {
        let mut buffer = FrameBuffer::with_max_frame_len(4);
        assert!(buffer.push(b"abcdef").is_empty());
        assert_eq!(buffer.pending_len(), 0);

        let frames = buffer.push(b"gh\nok\n");
        assert_eq!(texts(&frames), vec!["ok"]);

        let frames = buffer.push(b"toolong\nfine\n");
        assert_eq!(texts(&frames), vec!["fine"]);

        let frames = buffer.push(b"abcd\n");
        assert_eq!(texts(&frames), vec!["abcd"]);
    }

    #[tokio::test]
    async fn test_reader_yields_then_closes() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx);

        tx.write_all(b"REQ_CH").await.unwrap();
        tx.write_all(b"ECK_1\nCONN_PASS\npartial").await.unwrap();
        drop(tx);

        assert_eq!(reader.next_frame().await.unwrap().to_text(), "REQ_CHECK_1");
        assert_eq!(reader.next_frame().await.unwrap().to_text(), "CONN_PASS");
        assert!(matches!(reader.next_frame().await, Err(LinkError::ConnectionClosed)));
        assert!(matches!(reader.next_frame().await, Err(LinkError::ConnectionClosed)));
    }

    struct FailingSource;

    impl AsyncRead for FailingSource {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "link lost",
            )))
        }
    }

    #[tokio::test]
    async fn test_read_error_keeps_cause_then_closes() {
        let mut reader = FrameReader::new(FailingSource);

        match reader.next_frame().await {
            Err(LinkError::Socket { op, source }) => {
                assert_eq!(op, "read");
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(reader.next_frame().await, Err(LinkError::ConnectionClosed)));
    }
}
