//! Line-oriented multipart plumbing: the header block reader, preamble
//! skip, and a reader that yields one part's body up to the next boundary.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, ReadBuf};

/// How a part's body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PartEnd {
    /// `--boundary`: another part follows.
    Next,
    /// `--boundary--`: the multipart is complete.
    Terminal,
    /// The stream ended before any boundary.
    Eof,
}

/// Reads the raw header block (folded lines included) up to and excluding
/// the blank separator line, which is consumed. EOF also ends the block.
pub(crate) async fn read_header_block(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
) -> io::Result<Vec<u8>> {
    let mut block = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = src.read_until(b'\n', &mut line).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(block);
        }
        block.extend_from_slice(&line);
    }
}

/// Discards everything up to the first boundary line. Returns `true` when
/// a part follows, `false` on a terminal boundary or EOF.
pub(crate) async fn skip_preamble(
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    delimiter: &[u8],
) -> io::Result<bool> {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = src.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(false);
        }
        match classify(&line, delimiter) {
            Some(PartEnd::Next) => return Ok(true),
            Some(PartEnd::Terminal) => return Ok(false),
            _ => {}
        }
    }
}

/// Classifies a raw line as a boundary delimiter, tolerating trailing
/// linear whitespace as RFC 2046 requires.
fn classify(raw: &[u8], delimiter: &[u8]) -> Option<PartEnd> {
    let mut line = raw;
    while let Some((&last, rest)) = line.split_last() {
        if matches!(last, b'\r' | b'\n' | b' ' | b'\t') {
            line = rest;
        } else {
            break;
        }
    }
    if line == delimiter {
        Some(PartEnd::Next)
    } else if line.len() == delimiter.len() + 2
        && line.starts_with(delimiter)
        && line.ends_with(b"--")
    {
        Some(PartEnd::Terminal)
    } else {
        None
    }
}

/// Yields one part's body verbatim, ending at the enclosing boundary. The
/// line terminator preceding the boundary belongs to the delimiter and is
/// withheld; everything else passes through untouched.
pub(crate) struct PartReader<'a> {
    src: &'a mut (dyn AsyncBufRead + Send + Unpin),
    delimiter: &'a [u8],
    /// Accumulates the current raw line across buffer refills.
    line: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    /// Terminator of the previously emitted line, released only once the
    /// following line turns out not to be a boundary.
    holdback: Vec<u8>,
    end: Option<PartEnd>,
}

impl<'a> PartReader<'a> {
    pub(crate) fn new(
        src: &'a mut (dyn AsyncBufRead + Send + Unpin),
        delimiter: &'a [u8],
    ) -> Self {
        Self {
            src,
            delimiter,
            line: Vec::new(),
            out: Vec::new(),
            out_pos: 0,
            holdback: Vec::new(),
            end: None,
        }
    }

    /// How the part ended, once the reader has returned EOF.
    pub(crate) fn ending(&self) -> Option<PartEnd> {
        self.end
    }

    /// Moves a finished line into the output buffer, or records the end of
    /// the part when the line is a boundary.
    fn take_line(&mut self, at_eof: bool) {
        if let Some(end) = classify(&self.line, self.delimiter) {
            self.end = Some(end);
            self.line.clear();
            self.holdback.clear();
            return;
        }

        self.out.clear();
        self.out_pos = 0;
        self.out.append(&mut self.holdback);

        let term_len = if self.line.ends_with(b"\r\n") {
            2
        } else if self.line.ends_with(b"\n") {
            1
        } else {
            0
        };
        let body_len = self.line.len() - term_len;
        self.out.extend_from_slice(&self.line[..body_len]);
        if at_eof {
            // Nothing follows; no boundary can claim this terminator.
            self.out.extend_from_slice(&self.line[body_len..]);
        } else {
            self.holdback.extend_from_slice(&self.line[body_len..]);
        }
        self.line.clear();
    }
}

impl AsyncRead for PartReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.out_pos < this.out.len() {
                let available = &this.out[this.out_pos..];
                let to_copy = available.len().min(buf.remaining());
                buf.put_slice(&available[..to_copy]);
                this.out_pos += to_copy;
                return Poll::Ready(Ok(()));
            }
            if this.end.is_some() {
                return Poll::Ready(Ok(()));
            }

            // Accumulate the next raw line.
            loop {
                let chunk = match Pin::new(&mut *this.src).poll_fill_buf(cx) {
                    Poll::Ready(Ok(chunk)) => chunk,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };

                if chunk.is_empty() {
                    this.end = Some(PartEnd::Eof);
                    this.take_line(true);
                    // A bare EOF line may still be a terminal boundary.
                    if this.end == Some(PartEnd::Eof) && this.out_pos >= this.out.len() {
                        return Poll::Ready(Ok(()));
                    }
                    break;
                }

                match chunk.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        this.line.extend_from_slice(&chunk[..=pos]);
                        Pin::new(&mut *this.src).consume(pos + 1);
                        this.take_line(false);
                        break;
                    }
                    None => {
                        let len = chunk.len();
                        this.line.extend_from_slice(chunk);
                        Pin::new(&mut *this.src).consume(len);
                    }
                }
            }
        }
    }
}
