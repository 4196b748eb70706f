//! The DATA-phase body writer: dot-stuffs the outgoing stream and, on
//! finish, emits the terminating dot line and collects the final reply.
//!
//! Closing a writer cannot carry a reply, so the final `(code, message)`
//! is returned by [`BodySink::finish`] instead of riding a close result.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::AsyncWrite;

use crate::reply::Reply;

use super::Client;
use super::error::{ClientError, Result};

#[derive(Clone, Copy)]
enum StuffState {
    /// At the start of a line; `pending` records a held-back CRLF that has
    /// not been emitted yet.
    LineStart { pending: bool },
    Normal,
    SawCr,
}

/// RFC 5321 dot stuffing: a `.` at the start of a line is doubled. The
/// terminating CRLF of each line is held back so `end_message` can splice
/// the `CRLF . CRLF` terminator without duplicating line breaks.
pub(crate) struct DotStuffer {
    state: StuffState,
}

impl DotStuffer {
    pub(crate) const fn new() -> Self {
        Self {
            state: StuffState::LineStart { pending: false },
        }
    }

    pub(crate) fn process_chunk(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for &b in chunk {
            match self.state {
                StuffState::LineStart { pending } => {
                    if pending {
                        out.extend_from_slice(b"\r\n");
                    }
                    match b {
                        b'.' => {
                            out.extend_from_slice(b"..");
                            self.state = StuffState::Normal;
                        }
                        b'\r' => self.state = StuffState::SawCr,
                        b'\n' => {
                            out.push(b'\n');
                            self.state = StuffState::LineStart { pending: false };
                        }
                        _ => {
                            out.push(b);
                            self.state = StuffState::Normal;
                        }
                    }
                }
                StuffState::Normal => match b {
                    b'\r' => self.state = StuffState::SawCr,
                    b'\n' => {
                        out.push(b'\n');
                        self.state = StuffState::LineStart { pending: false };
                    }
                    _ => out.push(b),
                },
                StuffState::SawCr => match b {
                    b'\n' => self.state = StuffState::LineStart { pending: true },
                    b'\r' => out.push(b'\r'),
                    _ => {
                        // A bare CR is not a line break; release it.
                        out.push(b'\r');
                        out.push(b);
                        self.state = StuffState::Normal;
                    }
                },
            }
        }
    }

    /// Releases any held bytes, ensures the body ends with CRLF, and
    /// appends the `.` terminator line.
    pub(crate) fn end_message(&mut self, out: &mut Vec<u8>) {
        match self.state {
            StuffState::LineStart { pending: true } => out.extend_from_slice(b"\r\n.\r\n"),
            StuffState::LineStart { pending: false } => out.extend_from_slice(b".\r\n"),
            StuffState::Normal => out.extend_from_slice(b"\r\n.\r\n"),
            StuffState::SawCr => {
                out.push(b'\r');
                out.extend_from_slice(b"\r\n.\r\n");
            }
        }
        self.state = StuffState::LineStart { pending: false };
    }
}

/// Dot-stuffing body writer borrowed from a [`Client`] during DATA.
pub struct BodySink<'a> {
    client: &'a mut Client,
    stuffer: DotStuffer,
    staged: Vec<u8>,
    staged_pos: usize,
    written: u64,
}

impl<'a> BodySink<'a> {
    pub(crate) fn new(client: &'a mut Client) -> Self {
        Self {
            client,
            stuffer: DotStuffer::new(),
            staged: Vec::new(),
            staged_pos: 0,
            written: 0,
        }
    }

    /// Raw body bytes accepted so far, before stuffing.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn poll_flush_staged(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(connection) = self.client.connection.as_mut() else {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        };
        while self.staged_pos < self.staged.len() {
            let n = ready!(
                Pin::new(&mut *connection).poll_write(cx, &self.staged[self.staged_pos..])
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

    /// Flushes the stuffed body, writes the terminating dot line, and reads
    /// the upstream's final reply. Any code is accepted; the caller decides
    /// what a non-250 means.
    pub async fn finish(mut self) -> Result<Reply> {
        let mut tail = self.staged.split_off(self.staged_pos);
        self.stuffer.end_message(&mut tail);

        let connection = self
            .client
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(&tail).await?;

        let reply = self.client.read_reply(0).await?;
        self.client.last_data_reply = Some(reply.clone());
        Ok(reply)
    }
}

impl AsyncWrite for BodySink<'_> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        this.stuffer.process_chunk(buf, &mut this.staged);
        this.written += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_staged(cx))?;
        let Some(connection) = this.client.connection.as_mut() else {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        };
        Pin::new(connection).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The upstream socket outlives the body; only drain our staging.
        self.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuff(chunks: &[&[u8]]) -> Vec<u8> {
        let mut stuffer = DotStuffer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            stuffer.process_chunk(chunk, &mut out);
        }
        stuffer.end_message(&mut out);
        out
    }

    #[test]
    fn plain_body_gets_terminator() {
        assert_eq!(stuff(&[b"Hello\r\nWorld\r\n"]), b"Hello\r\nWorld\r\n.\r\n");
    }

    #[test]
    fn dot_at_line_start_is_doubled() {
        assert_eq!(stuff(&[b".\r\n"]), b"..\r\n.\r\n");
        assert_eq!(stuff(&[b"a\r\n.hidden\r\n"]), b"a\r\n..hidden\r\n.\r\n");
    }

    #[test]
    fn leading_dot_of_message_is_doubled() {
        assert_eq!(stuff(&[b".starts with dot"]), b"..starts with dot\r\n.\r\n");
    }

    #[test]
    fn dot_mid_line_untouched() {
        assert_eq!(stuff(&[b"a.b\r\n"]), b"a.b\r\n.\r\n");
    }

    #[test]
    fn body_without_trailing_newline_gains_one() {
        assert_eq!(stuff(&[b"no newline"]), b"no newline\r\n.\r\n");
    }

    #[test]
    fn empty_body() {
        assert_eq!(stuff(&[b""]), b".\r\n");
    }

    #[test]
    fn split_across_chunks() {
        // CRLF and the following dot arrive in different writes.
        assert_eq!(stuff(&[b"a\r", b"\n", b".", b"b\r\n"]), b"a\r\n..b\r\n.\r\n");
    }

    #[test]
    fn bare_cr_is_not_a_line_break() {
        assert_eq!(stuff(&[b"a\r.b\r\n"]), b"a\r.b\r\n.\r\n");
    }
}
