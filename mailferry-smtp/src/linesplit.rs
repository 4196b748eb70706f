//! Fixed-width line splitting for encoded output.
//!
//! RFC 2045 section 6.8 caps base64 lines at 76 characters; the splitter
//! inserts the separator every `width` payload bytes, carrying the running
//! count across writes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncWrite;

pub struct LineSplitter<W> {
    inner: W,
    width: usize,
    sep: Vec<u8>,
    /// Payload bytes emitted since the last separator.
    count: usize,
    /// Total bytes emitted, separators included.
    emitted: u64,
    staged: Vec<u8>,
    staged_pos: usize,
}

impl<W: AsyncWrite + Unpin> LineSplitter<W> {
    pub fn new(width: usize, sep: &[u8], inner: W) -> Self {
        assert!(width > 0, "split width must be non-zero");
        Self {
            inner,
            width,
            sep: sep.to_vec(),
            count: 0,
            emitted: 0,
            staged: Vec::new(),
            staged_pos: 0,
        }
    }

    /// Total bytes pushed towards the inner writer, separators included.
    /// `poll_write` returns input progress per the `AsyncWrite` contract,
    /// so callers doing framed accounting read the true encoded length here.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn stage(&mut self, buf: &[u8]) {
        let mut pos = 0;
        while pos < buf.len() {
            let take = (self.width - self.count).min(buf.len() - pos);
            self.staged.extend_from_slice(&buf[pos..pos + take]);
            self.count += take;
            self.emitted += take as u64;
            pos += take;

            if self.count == self.width {
                self.staged.extend_from_slice(&self.sep);
                self.emitted += self.sep.len() as u64;
                self.count = 0;
            }
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
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LineSplitter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        this.stage(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
