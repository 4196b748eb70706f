//! The downstream transport: a plain or TLS stream with an internal read
//! buffer, an optional raw-byte debug sink, and the STARTTLS accept path.

use std::fs::File;
use std::io::{self, BufReader as StdBufReader, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};

use mailferry_common::config::TlsContext;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::error::{ConnectionError, TlsError};

const READ_BUFFER_SIZE: usize = 8192;

/// Sink receiving a copy of every raw byte read from or written to the
/// downstream leg. Wire bytes are never altered on the way through.
pub type DebugSink = Arc<Mutex<dyn Write + Send>>;

enum Io<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin> AsyncRead for Io<Stream> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Io<Stream> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A downstream STARTTLS upgrade failure. When the raw stream survived the
/// failed handshake it is handed back so the handler can still report the
/// error in-band.
pub(crate) struct UpgradeError<Stream> {
    pub error: TlsError,
    pub connection: Option<Connection<Stream>>,
}

pub(crate) struct Connection<Stream> {
    io: Io<Stream>,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    debug: Option<DebugSink>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub(crate) fn new(stream: Stream, debug: Option<DebugSink>) -> Self {
        Self {
            io: Io::Plain(stream),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
            debug,
        }
    }

    pub(crate) const fn is_tls(&self) -> bool {
        matches!(self.io, Io::Tls(_))
    }

    /// Reads one CRLF-terminated line, without its terminator.
    pub(crate) async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut raw = Vec::new();
        let n = self.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(ConnectionError::Closed);
        }
        if raw.last() == Some(&b'\n') {
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
        }
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    /// Writes one line plus CRLF and flushes it out.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<(), ConnectionError> {
        self.io.write_all(line.as_bytes()).await?;
        self.io.write_all(b"\r\n").await?;
        self.io.flush().await?;

        if let Some(debug) = &self.debug {
            if let Ok(mut sink) = debug.lock() {
                let _ = sink.write_all(line.as_bytes());
                let _ = sink.write_all(b"\r\n");
            }
        }
        Ok(())
    }

    fn load_certs(path: &std::path::Path) -> io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut StdBufReader::new(File::open(path)?)).collect()
    }

    fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, TlsError> {
        let path_str = path.display().to_string();
        let mut reader = StdBufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "unable to determine key format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }

    /// Accepts a TLS handshake over this connection, replacing the plain
    /// stream. The read buffer and debug sink carry over unchanged.
    pub(crate) async fn upgrade(
        self,
        tls_context: &TlsContext,
    ) -> Result<Self, UpgradeError<Stream>> {
        let Self {
            io,
            read_buf,
            read_pos,
            read_len,
            debug,
        } = self;

        let stream = match io {
            Io::Plain(stream) => stream,
            Io::Tls(_) => {
                return Err(UpgradeError {
                    error: TlsError::Rustls("connection is already TLS".to_string()),
                    connection: Some(Self {
                        io,
                        read_buf,
                        read_pos,
                        read_len,
                        debug,
                    }),
                });
            }
        };

        let rebuild = |stream: Stream| Self {
            io: Io::Plain(stream),
            read_buf: Vec::new(),
            read_pos: 0,
            read_len: 0,
            debug: debug.clone(),
        };

        let config = match Self::tls_config(tls_context) {
            Ok(config) => config,
            Err(error) => {
                return Err(UpgradeError {
                    error,
                    connection: Some(rebuild(stream)),
                });
            }
        };

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let accept = acceptor.accept(stream).into_fallible();
        match accept.await {
            Ok(stream) => Ok(Self {
                io: Io::Tls(Box::new(stream)),
                read_buf,
                read_pos,
                read_len,
                debug,
            }),
            Err((error, io)) => Err(UpgradeError {
                error: TlsError::Handshake(error),
                connection: Some(rebuild(io)),
            }),
        }
    }

    fn tls_config(tls_context: &TlsContext) -> Result<ServerConfig, TlsError> {
        let certs = Self::load_certs(&tls_context.certificate).map_err(|e| {
            TlsError::CertificateLoad {
                path: tls_context.certificate.display().to_string(),
                source: e,
            }
        })?;
        let key = Self::load_key(&tls_context.key)?;

        Ok(ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?)
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> AsyncRead for Connection<Stream> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let available = ready!(Pin::new(&mut *this).poll_fill_buf(cx))?;
        let to_copy = available.len().min(buf.remaining());
        buf.put_slice(&available[..to_copy]);
        Pin::new(this).consume(to_copy);
        Poll::Ready(Ok(()))
    }
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> AsyncBufRead for Connection<Stream> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();

        if this.read_pos >= this.read_len {
            if this.read_buf.is_empty() {
                this.read_buf.resize(READ_BUFFER_SIZE, 0);
            }

            let mut read_buf = ReadBuf::new(&mut this.read_buf);
            ready!(Pin::new(&mut this.io).poll_read(cx, &mut read_buf))?;
            let n = read_buf.filled().len();
            this.read_pos = 0;
            this.read_len = n;

            if n > 0 {
                if let Some(debug) = &this.debug {
                    if let Ok(mut sink) = debug.lock() {
                        let _ = sink.write_all(&this.read_buf[..n]);
                    }
                }
            }
        }

        Poll::Ready(Ok(&this.read_buf[this.read_pos..this.read_len]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.get_mut();
        this.read_pos = (this.read_pos + amt).min(this.read_len);
    }
}
