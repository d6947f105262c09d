//! Non-destructive peeking and protocol detection on live streams.
//!
//! [`PeekableStream`] buffers bytes read ahead of the consumer. Reads
//! through its `AsyncRead` impl drain that buffer before touching the inner
//! stream, so whatever the detector looked at is still delivered to whoever
//! handles the connection next.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use portmux_protocol::{classify, classify_final, Classification, DetectionError, ProtocolTag, PEEK_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Read-ahead chunk size.
const FILL_CHUNK: usize = 4096;

/// Stream wrapper that supports looking at bytes before consuming them.
#[derive(Debug)]
pub struct PeekableStream<S> {
    inner: S,
    buf: Vec<u8>,
    /// Start of the unconsumed region of `buf`.
    pos: usize,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes read from the inner stream but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Mark `n` buffered bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Split into the inner stream and the bytes that were never consumed.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let pending = self.buf.split_off(self.pos);
        (self.inner, pending)
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Read one more chunk into the buffer.
    ///
    /// Returns the number of bytes added; zero means end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buf.reserve(FILL_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Buffer at least `n` bytes, or everything up to end of stream.
    ///
    /// Nothing is consumed; the returned slice may be longer than `n` if the
    /// inner stream delivered more in one read, or shorter at end of stream.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered().len() < n {
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(self.buffered())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buf.len() {
            let available = &this.buf[this.pos..];
            let n = available.len().min(out.remaining());
            out.put_slice(&available[..n]);
            this.consume(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Classify the protocol spoken on `stream` without consuming any bytes.
///
/// Peeks incrementally and stops as soon as the prefix is decisive, so a
/// short request never waits for a full [`PEEK_LEN`] bytes.
pub async fn detect<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
) -> Result<ProtocolTag, DetectionError> {
    loop {
        let buffered = stream.buffered();
        let window = &buffered[..buffered.len().min(PEEK_LEN)];
        if let Classification::Decided(tag) = classify(window) {
            return Ok(tag);
        }

        if stream.fill().await? == 0 {
            let buffered = stream.buffered();
            return classify_final(&buffered[..buffered.len().min(PEEK_LEN)]);
        }
    }
}

/// [`detect`] bounded by a deadline.
pub async fn detect_with_timeout<S: AsyncRead + Unpin>(
    stream: &mut PeekableStream<S>,
    timeout: Duration,
) -> Result<ProtocolTag, DetectionError> {
    match tokio::time::timeout(timeout, detect(stream)).await {
        Ok(result) => result,
        Err(_) => Err(DetectionError::Timeout(timeout)),
    }
}
