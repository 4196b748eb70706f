//! Streaming MIME transform for the DATA phase.
//!
//! A message flows from the downstream dot-reader to the upstream body
//! sink. With an inactive wrapper this is a plain byte copy; with an
//! active one the copier walks the MIME structure, hands `text/html`
//! leaves to the wrapper (transparently unwrapping base64), and passes
//! everything else through unchanged. No path materialises the whole
//! body in memory.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};

use crate::linesplit::LineSplitter;

mod b64;
mod part;

use b64::{Base64Reader, Base64Writer};
use part::{PartEnd, PartReader, read_header_block, skip_preamble};

const CRLF: &[u8] = b"\r\n";
const MULTIPART_PREAMBLE: &[u8] = b"This is a multi-part message in MIME format.\r\n";

/// RFC 2045 section 6.8: encoded output lines are at most 76 characters.
const BASE64_LINE_WIDTH: usize = 76;

/// Externally supplied policy for rewriting HTML message parts. The engine
/// itself only ships [`IdentityWrapper`].
#[async_trait]
pub trait Wrapper: Send + Sync {
    /// Whether the wrapper wants to see message content at all. When this
    /// is false the copier degrades to a plain byte copy.
    fn active(&self) -> bool;

    /// Inspect or amend the top-level message headers before they are
    /// re-serialised.
    fn process_headers(&self, headers: &mut HeaderMap) -> io::Result<()> {
        let _ = headers;
        Ok(())
    }

    /// Stream one decoded `text/html` part from `src` to `dst`, applying
    /// whatever edits the policy calls for. Returns the bytes written.
    async fn track_html(
        &self,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64>;
}

/// The default wrapper: inactive, so mail passes through byte for byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityWrapper;

#[async_trait]
impl Wrapper for IdentityWrapper {
    fn active(&self) -> bool {
        false
    }

    async fn track_html(
        &self,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        tokio::io::copy(src, dst).await
    }
}

/// An order-preserving multimap of RFC 5322 header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// The first value stored under `name`, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replaces the first entry named `name`, or appends one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        match self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.into(),
            None => self.entries.push((name.to_string(), value.into())),
        }
    }

    /// Appends an entry, keeping any existing ones with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Streams one message from `src` to `dst`. The wrapper decides whether
/// anything is rewritten on the way through.
pub async fn copy_message(
    dst: &mut (dyn AsyncWrite + Send + Unpin),
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    wrapper: &dyn Wrapper,
) -> io::Result<u64> {
    if !wrapper.active() {
        return tokio::io::copy(src, dst).await;
    }
    copy_rfc822(dst, src, wrapper).await
}

/// Parses the header block of one RFC 5322 message (top level or embedded)
/// and dispatches on its content type. Boxed so the multipart and
/// `message/rfc822` cases can recurse.
fn copy_rfc822<'a>(
    dst: &'a mut (dyn AsyncWrite + Send + Unpin),
    src: &'a mut (dyn AsyncBufRead + Send + Unpin),
    wrapper: &'a dyn Wrapper,
) -> BoxFuture<'a, io::Result<u64>> {
    Box::pin(async move {
        let block = read_header_block(src).await?;
        let mut headers = parse_header_map(&block)?;
        wrapper.process_headers(&mut headers)?;

        let mut written = 0u64;
        for (name, value) in headers.iter() {
            let line = format!("{name}: {value}\r\n");
            dst.write_all(line.as_bytes()).await?;
            written += line.len() as u64;
        }
        dst.write_all(CRLF).await?;
        written += CRLF.len() as u64;

        let ctype = headers.get("Content-Type").unwrap_or("").to_string();
        let cte = headers
            .get("Content-Transfer-Encoding")
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        written += copy_part(dst, src, &ctype, &cte, wrapper).await?;
        Ok(written)
    })
}

fn parse_header_map(block: &[u8]) -> io::Result<HeaderMap> {
    let (parsed, _) = mailparse::parse_headers(block)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut headers = HeaderMap::default();
    for header in parsed {
        let raw = String::from_utf8_lossy(header.get_value_raw());
        headers.append(header.get_key(), raw.trim_end_matches(['\r', '\n']));
    }
    Ok(headers)
}

/// Copies one body with known content type and transfer encoding. HTML
/// leaves go through the wrapper, multiparts recurse per part, embedded
/// messages recurse whole, and everything else is a byte copy. Media types
/// that fail to parse fall back to `text/plain` rather than aborting.
fn copy_part<'a>(
    dst: &'a mut (dyn AsyncWrite + Send + Unpin),
    src: &'a mut (dyn AsyncBufRead + Send + Unpin),
    ctype: &'a str,
    cte: &'a str,
    wrapper: &'a dyn Wrapper,
) -> BoxFuture<'a, io::Result<u64>> {
    Box::pin(async move {
        let media = mailparse::parse_content_type(ctype);
        let mimetype = media.mimetype.to_ascii_lowercase();

        if mimetype.starts_with("text/html") {
            copy_html(dst, src, cte, wrapper).await
        } else if mimetype.starts_with("multipart/") {
            match media.params.get("boundary") {
                Some(boundary) if !boundary.is_empty() => {
                    copy_multipart(dst, src, boundary, wrapper).await
                }
                _ => tokio::io::copy(src, dst).await,
            }
        } else if mimetype.starts_with("message/rfc822") {
            copy_rfc822(dst, src, wrapper).await
        } else {
            tokio::io::copy(src, dst).await
        }
    })
}

async fn copy_html(
    dst: &mut (dyn AsyncWrite + Send + Unpin),
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    cte: &str,
    wrapper: &dyn Wrapper,
) -> io::Result<u64> {
    match cte {
        "base64" => {
            let mut plain = ReadAdapter(src);
            let mut decoded = Base64Reader::new(&mut plain);
            let splitter = LineSplitter::new(BASE64_LINE_WIDTH, CRLF, &mut *dst);
            let mut encoder = Base64Writer::new(splitter);

            let written = wrapper.track_html(&mut encoder, &mut decoded).await?;
            let mut splitter = encoder.finish().await?;
            splitter.flush().await?;
            Ok(written)
        }
        "" | "7bit" | "8bit" => {
            wrapper
                .track_html(&mut *dst, &mut ReadAdapter(src))
                .await
        }
        other => {
            tracing::warn!(
                encoding = other,
                "unhandled Content-Transfer-Encoding on text/html part, passing through"
            );
            wrapper
                .track_html(&mut *dst, &mut ReadAdapter(src))
                .await
        }
    }
}

async fn copy_multipart(
    dst: &mut (dyn AsyncWrite + Send + Unpin),
    src: &mut (dyn AsyncBufRead + Send + Unpin),
    boundary: &str,
    wrapper: &dyn Wrapper,
) -> io::Result<u64> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut written = 0u64;

    dst.write_all(MULTIPART_PREAMBLE).await?;
    written += MULTIPART_PREAMBLE.len() as u64;

    let mut have_part = skip_preamble(src, &delimiter).await?;
    let mut first = true;
    while have_part {
        let lead = if first {
            format!("--{boundary}\r\n")
        } else {
            format!("\r\n--{boundary}\r\n")
        };
        first = false;
        dst.write_all(lead.as_bytes()).await?;
        written += lead.len() as u64;

        // Part headers travel verbatim; they are only parsed on the side
        // to learn the part's type and encoding.
        let head = read_header_block(src).await?;
        let headers = parse_header_map(&head)?;
        let ctype = headers.get("Content-Type").unwrap_or("").to_string();
        let cte = headers
            .get("Content-Transfer-Encoding")
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        dst.write_all(&head).await?;
        dst.write_all(CRLF).await?;
        written += head.len() as u64 + CRLF.len() as u64;

        let mut part = PartReader::new(src, &delimiter);
        {
            let mut buffered = BufReader::new(&mut part);
            written += copy_part(dst, &mut buffered, &ctype, &cte, wrapper).await?;
        }
        // The transform may stop short of the boundary (base64 padding,
        // trailing blank lines); drain the rest without emitting it.
        tokio::io::copy(&mut part, &mut tokio::io::sink()).await?;

        have_part = part.ending() == Some(PartEnd::Next);
    }

    let close = format!("\r\n--{boundary}--\r\n");
    dst.write_all(close.as_bytes()).await?;
    written += close.len() as u64;
    Ok(written)
}

/// Exposes a buffered reader's plain `AsyncRead` face without another
/// layer of buffering.
struct ReadAdapter<'a, 'b>(&'a mut (dyn AsyncBufRead + Send + Unpin + 'b));

impl AsyncRead for ReadAdapter<'_, '_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let available = match Pin::new(&mut *this.0).poll_fill_buf(cx) {
            Poll::Ready(Ok(chunk)) => chunk,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        let to_copy = available.len().min(buf.remaining());
        buf.put_slice(&available[..to_copy]);
        Pin::new(&mut *this.0).consume(to_copy);
        Poll::Ready(Ok(()))
    }
}
