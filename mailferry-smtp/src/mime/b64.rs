//! Streaming base64 transcoding for rewritten HTML parts. The reader
//! unwraps an encoded part into raw bytes; the writer re-encodes, feeding
//! a line splitter so output lines obey RFC 2045.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

const CHUNK: usize = 4096;

fn invalid(err: base64::DecodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Decodes a base64 stream, ignoring interleaved whitespace and line
/// breaks, and decoding aligned four-character groups as they arrive.
pub(crate) struct Base64Reader<'a> {
    src: &'a mut (dyn AsyncRead + Send + Unpin),
    tmp: Vec<u8>,
    /// Whitespace-stripped characters not yet decoded (fewer than four, or
    /// waiting for the next refill).
    carry: Vec<u8>,
    decoded: Vec<u8>,
    decoded_pos: usize,
    eof: bool,
}

impl<'a> Base64Reader<'a> {
    pub(crate) fn new(src: &'a mut (dyn AsyncRead + Send + Unpin)) -> Self {
        Self {
            src,
            tmp: vec![0u8; CHUNK],
            carry: Vec::new(),
            decoded: Vec::new(),
            decoded_pos: 0,
            eof: false,
        }
    }
}

impl AsyncRead for Base64Reader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.decoded_pos < this.decoded.len() {
                let available = &this.decoded[this.decoded_pos..];
                let to_copy = available.len().min(buf.remaining());
                buf.put_slice(&available[..to_copy]);
                this.decoded_pos += to_copy;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.tmp);
            ready!(Pin::new(&mut *this.src).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();

            if filled.is_empty() {
                this.eof = true;
                if !this.carry.is_empty() {
                    // An unpadded tail; decode what remains.
                    let tail = STANDARD_NO_PAD
                        .decode(&this.carry)
                        .map_err(invalid)?;
                    this.decoded = tail;
                    this.decoded_pos = 0;
                    this.carry.clear();
                }
                continue;
            }

            this.carry
                .extend(filled.iter().filter(|b| !b.is_ascii_whitespace()));

            // Padding marks the end of the encoded data; decode everything
            // up to and including it in one go.
            if let Some(pad) = this.carry.iter().position(|&b| b == b'=') {
                let end = (pad + 4 - pad % 4).min(this.carry.len());
                if end % 4 == 0 {
                    this.decoded = STANDARD.decode(&this.carry[..end]).map_err(invalid)?;
                    this.decoded_pos = 0;
                    this.carry.clear();
                    this.eof = true;
                    continue;
                }
            }

            let aligned = this.carry.len() / 4 * 4;
            if aligned > 0 {
                this.decoded = STANDARD_NO_PAD
                    .decode(&this.carry[..aligned])
                    .map_err(invalid)?;
                this.decoded_pos = 0;
                this.carry.drain(..aligned);
            }
        }
    }
}

/// Encodes raw bytes as base64, pushing the encoded text through the inner
/// writer (typically a [`LineSplitter`](crate::linesplit::LineSplitter)).
/// `finish` emits the padded tail.
pub(crate) struct Base64Writer<W> {
    inner: W,
    /// Zero to two raw bytes awaiting a full three-byte group.
    carry: Vec<u8>,
    staged: Vec<u8>,
    staged_pos: usize,
}

impl<W: AsyncWrite + Unpin> Base64Writer<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            carry: Vec::new(),
            staged: Vec::new(),
            staged_pos: 0,
        }
    }

    fn poll_flush_staged(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.staged_pos < self.staged.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.staged[self.staged_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.staged_pos += n;
        }
        self.staged.clear();
        self.staged_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Encodes and writes the remaining partial group with padding,
    /// flushes, and hands the inner writer back.
    pub(crate) async fn finish(mut self) -> io::Result<W> {
        let staged = self.staged.split_off(self.staged_pos);
        self.inner.write_all(&staged).await?;
        if !self.carry.is_empty() {
            let tail = STANDARD.encode(&self.carry);
            self.inner.write_all(tail.as_bytes()).await?;
        }
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Base64Writer<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;

        let total = this.carry.len() + buf.len();
        let aligned = total / 3 * 3;
        if aligned == 0 {
            this.carry.extend_from_slice(buf);
            return Poll::Ready(Ok(buf.len()));
        }

        let from_buf = aligned - this.carry.len();
        let mut group = Vec::with_capacity(aligned);
        group.append(&mut this.carry);
        group.extend_from_slice(&buf[..from_buf]);

        this.staged = STANDARD_NO_PAD.encode(&group).into_bytes();
        this.staged_pos = 0;
        this.carry.extend_from_slice(&buf[from_buf..]);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The tail is only emitted by `finish`; a shutdown just drains.
        self.poll_flush(cx)
    }
}
