//! The DATA-phase body reader: un-stuffs leading dots and terminates at
//! the `CRLF . CRLF` marker, leaving any bytes after the terminator in the
//! underlying buffer for the next command.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    LineStart,
    Mid,
    /// Consumed a `.` at the start of a line; the next byte decides whether
    /// this is the terminator or a stuffed dot.
    AfterDot,
    AfterDotCr,
    Done,
}

/// Reads a dot-terminated SMTP body off a buffered stream. Bytes pass
/// through verbatim (CRLF intact); only stuffing dots and the terminator
/// line are removed.
pub(crate) struct DotReader<R> {
    inner: R,
    state: State,
    /// Overflow bytes decided for output that did not fit the caller's
    /// buffer. At most two bytes deep.
    pending: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> DotReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::LineStart,
            pending: Vec::new(),
        }
    }

    /// Whether the terminator has been consumed.
    pub(crate) fn finished(&self) -> bool {
        self.state == State::Done && self.pending.is_empty()
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DotReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while !this.pending.is_empty() && buf.remaining() > 0 {
            let b = this.pending.remove(0);
            buf.put_slice(&[b]);
        }
        if buf.remaining() == 0 || this.state == State::Done {
            return Poll::Ready(Ok(()));
        }

        let written_before = buf.filled().len();
        loop {
            let chunk = match Pin::new(&mut this.inner).poll_fill_buf(cx) {
                Poll::Ready(Ok(chunk)) => chunk,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // Hand back whatever was produced so far rather than
                    // losing it behind a Pending.
                    return if buf.filled().len() > written_before {
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Pending
                    };
                }
            };

            if chunk.is_empty() {
                return if buf.filled().len() > written_before {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before message terminator",
                    )))
                };
            }

            let mut consumed = 0;
            for &b in chunk {
                if buf.remaining() == 0 && this.pending.is_empty() {
                    break;
                }
                consumed += 1;

                let mut emit = |out: &mut ReadBuf<'_>, pending: &mut Vec<u8>, b: u8| {
                    if out.remaining() > 0 {
                        out.put_slice(&[b]);
                    } else {
                        pending.push(b);
                    }
                };

                match this.state {
                    State::LineStart => {
                        if b == b'.' {
                            this.state = State::AfterDot;
                        } else {
                            emit(buf, &mut this.pending, b);
                            this.state = if b == b'\n' { State::LineStart } else { State::Mid };
                        }
                    }
                    State::Mid => {
                        emit(buf, &mut this.pending, b);
                        if b == b'\n' {
                            this.state = State::LineStart;
                        }
                    }
                    State::AfterDot => match b {
                        b'\r' => this.state = State::AfterDotCr,
                        b'\n' => {
                            this.state = State::Done;
                            break;
                        }
                        _ => {
                            // Stuffed dot: drop it, keep the byte.
                            emit(buf, &mut this.pending, b);
                            this.state = State::Mid;
                        }
                    },
                    State::AfterDotCr => {
                        if b == b'\n' {
                            this.state = State::Done;
                            break;
                        }
                        emit(buf, &mut this.pending, b'\r');
                        emit(buf, &mut this.pending, b);
                        this.state = State::Mid;
                    }
                    State::Done => break,
                }
            }
            Pin::new(&mut this.inner).consume(consumed);

            if this.state == State::Done || buf.filled().len() > written_before {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn unstuff(wire: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut cursor = BufReader::new(wire);
        let mut reader = DotReader::new(&mut cursor);
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert!(reader.finished());

        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).await.unwrap();
        (body, rest)
    }

    #[tokio::test]
    async fn plain_body() {
        let (body, rest) = unstuff(b"Hello\r\nWorld\r\n.\r\n").await;
        assert_eq!(body, b"Hello\r\nWorld\r\n");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn stuffed_dots_are_removed() {
        let (body, _) = unstuff(b"..leading\r\na.b\r\n..\r\n.\r\n").await;
        assert_eq!(body, b".leading\r\na.b\r\n.\r\n");
    }

    #[tokio::test]
    async fn bytes_after_terminator_stay_buffered() {
        let (body, rest) = unstuff(b"one\r\n.\r\nQUIT\r\n").await;
        assert_eq!(body, b"one\r\n");
        assert_eq!(rest, b"QUIT\r\n");
    }

    #[tokio::test]
    async fn empty_body() {
        let (body, rest) = unstuff(b".\r\nRSET\r\n").await;
        assert!(body.is_empty());
        assert_eq!(rest, b"RSET\r\n");
    }

    #[tokio::test]
    async fn eof_before_terminator_is_an_error() {
        let mut cursor = BufReader::new(&b"partial body\r\n"[..]);
        let mut reader = DotReader::new(&mut cursor);
        let mut body = Vec::new();
        let err = reader.read_to_end(&mut body).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn dot_line_with_garbage_after_cr() {
        // ".\rX" is not a terminator; the dot is dropped, CR X pass through.
        let (body, _) = unstuff(b".\rX\r\n.\r\n").await;
        assert_eq!(body, b"\rX\r\n");
    }

    mod props {
        use super::*;
        use crate::client::data::DotStuffer;
        use proptest::prelude::*;

        proptest! {
            /// Stuffing a CRLF-lined body and reading it back through the
            /// dot-reader restores the body exactly, dots and all.
            #[test]
            fn stuff_then_unstuff_round_trips(
                lines in proptest::collection::vec("[ -~]{0,30}", 0..8),
            ) {
                let mut body = Vec::new();
                for line in &lines {
                    body.extend_from_slice(line.as_bytes());
                    body.extend_from_slice(b"\r\n");
                }

                let mut stuffer = DotStuffer::new();
                let mut wire = Vec::new();
                stuffer.process_chunk(&body, &mut wire);
                stuffer.end_message(&mut wire);

                let decoded = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .expect("runtime")
                    .block_on(async {
                        let mut cursor = BufReader::new(&wire[..]);
                        let mut reader = DotReader::new(&mut cursor);
                        let mut decoded = Vec::new();
                        reader.read_to_end(&mut decoded).await.expect("unstuff");
                        assert!(reader.finished());
                        decoded
                    });
                prop_assert_eq!(decoded, body);
            }
        }
    }
}
