//! The upstream leg: an SMTP client holding one connection to the relay
//! target, with EHLO capability discovery and STARTTLS upgrade support.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::reply::Reply;

pub mod data;
pub mod error;

use data::BodySink;
use error::{ClientError, Result};

/// Initial size of the reply read buffer.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the reply read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// TLS parameters for the upstream leg.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// SNI name; when empty the client falls back to the host component of
    /// the dialled address.
    pub server_name: Option<String>,
    /// Skip certificate verification. Only sensible against a relay target
    /// with a self-signed certificate.
    pub insecure_skip_verify: bool,
}

pub(crate) enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    pub(crate) async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, insecure_skip_verify: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let mut root_store = RootCertStore::empty();

                let certs = rustls_native_certs::load_native_certs();
                for cert in certs.certs {
                    root_store
                        .add(cert)
                        .map_err(|e| ClientError::Tls(format!("failed to add certificate: {e}")))?;
                }
                if !certs.errors.is_empty() {
                    tracing::warn!(?certs.errors, "some root certificates could not be loaded");
                }

                let mut config = ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();

                if insecure_skip_verify {
                    config
                        .dangerous()
                        .set_certificate_verifier(Arc::new(NoVerifier));
                }

                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(domain.to_string())
                    .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;

                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::Tls(e.to_string()))?;

                Ok(Self::Tls(Box::new(stream)))
            }
            Self::Tls(_) => Err(ClientError::Tls("connection is already TLS".to_string())),
        }
    }
}

impl AsyncWrite for ClientConnection {
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

/// A certificate verifier that accepts anything. Selected only when the
/// verify-skip flag is set.
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP client for the upstream leg of the relay.
pub struct Client {
    pub(crate) connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_name: String,
    local_name: String,
    did_hello: bool,
    hello_reply: Option<Reply>,
    ext: HashMap<String, String>,
    pub(crate) last_data_reply: Option<Reply>,
}

impl Client {
    /// Connects to the upstream server at `addr` (`host:port`) and reads
    /// the 220 banner. The host component becomes the default TLS SNI.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::with_connection(ClientConnection::Plain(stream), host_of(addr)).await
    }

    /// Connects with implicit TLS (smtps-style) and reads the 220 banner.
    pub async fn connect_tls(addr: &str, opts: &TlsOptions) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let host = opts
            .server_name
            .clone()
            .unwrap_or_else(|| host_of(addr));
        let connection = ClientConnection::Plain(stream)
            .upgrade_to_tls(&host, opts.insecure_skip_verify)
            .await?;
        Self::with_connection(connection, host).await
    }

    async fn with_connection(connection: ClientConnection, host: String) -> Result<Self> {
        let mut client = Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_name: host,
            local_name: "localhost".to_string(),
            did_hello: false,
            hello_reply: None,
            ext: HashMap::new(),
            last_data_reply: None,
        };
        client.read_reply(220).await?;
        Ok(client)
    }

    /// Whether the upstream leg currently runs over TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Runs the EHLO-then-HELO exchange as `local_name`, once. Repeat calls
    /// after a success return the cached greeting reply.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Line`] before anything is sent when the
    /// name contains CR or LF; transport and reply errors otherwise.
    pub async fn hello(&mut self, local_name: &str) -> Result<Reply> {
        validate_line(local_name)?;
        self.local_name = local_name.to_string();

        if self.did_hello {
            if let Some(reply) = &self.hello_reply {
                return Ok(reply.clone());
            }
        }

        self.did_hello = true;
        let reply = match self.ehlo().await {
            Ok(reply) => reply,
            // The upstream may not speak ESMTP; fall back to a basic HELO.
            Err(_) => self.helo().await?,
        };
        self.hello_reply = Some(reply.clone());
        Ok(reply)
    }

    async fn ehlo(&mut self) -> Result<Reply> {
        let line = format!("EHLO {}", self.local_name);
        let reply = self.cmd(250, &line).await?;

        let mut ext = HashMap::new();
        let mut lines = reply.lines.iter();
        lines.next(); // greeting line
        for line in lines {
            match line.split_once(' ') {
                Some((token, param)) => {
                    ext.insert(token.to_ascii_uppercase(), param.to_string());
                }
                None => {
                    ext.insert(line.to_ascii_uppercase(), String::new());
                }
            }
        }
        self.ext = ext;
        Ok(reply)
    }

    async fn helo(&mut self) -> Result<Reply> {
        self.ext = HashMap::new();
        let line = format!("HELO {}", self.local_name);
        self.cmd(250, &line).await
    }

    /// Sends one command line and awaits the reply, checking it against
    /// `expect` (0 means any).
    ///
    /// # Errors
    ///
    /// [`ClientError::UnexpectedReply`] carries the actual reply when the
    /// class does not match; transport failures produce no reply at all.
    pub async fn cmd(&mut self, expect: u16, line: &str) -> Result<Reply> {
        self.send_line(line).await?;
        self.read_reply(expect).await
    }

    /// Issues STARTTLS and, on a 220, replaces the transport with a TLS
    /// client connection. `did_hello` is cleared so the next greeting runs
    /// a fresh EHLO; re-greeting is the caller's decision.
    pub async fn starttls(&mut self, opts: &TlsOptions) -> Result<Reply> {
        let reply = self.cmd(220, "STARTTLS").await?;

        let domain = match &opts.server_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.server_name.clone(),
        };

        let connection = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            connection
                .upgrade_to_tls(&domain, opts.insecure_skip_verify)
                .await?,
        );
        self.buffer_pos = 0;
        self.did_hello = false;
        self.hello_reply = None;
        Ok(reply)
    }

    /// Issues `DATA` and awaits the 354 go-ahead. Stream the body through
    /// [`Client::body_sink`] afterwards.
    pub async fn data(&mut self) -> Result<Reply> {
        self.cmd(354, "DATA").await
    }

    /// A dot-stuffing writer for the message body. Its
    /// [`finish`](BodySink::finish) emits the terminating dot and returns
    /// the upstream's final reply.
    pub fn body_sink(&mut self) -> BodySink<'_> {
        BodySink::new(self)
    }

    /// The final reply of the most recent DATA exchange, if one completed.
    #[must_use]
    pub fn last_data_reply(&self) -> Option<&Reply> {
        self.last_data_reply.as_ref()
    }

    /// Case-insensitive extension lookup; the parameter string is returned
    /// when the extension was advertised.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.ext.get(&name.to_ascii_uppercase()).map(String::as_str)
    }

    /// All advertised extensions, upper-cased and lexicographically sorted
    /// so downstream EHLO replies are stable run over run.
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .ext
            .iter()
            .map(|(name, param)| {
                if param.is_empty() {
                    name.to_ascii_uppercase()
                } else {
                    format!("{} {}", name.to_ascii_uppercase(), param.to_ascii_uppercase())
                }
            })
            .collect();
        caps.sort();
        caps
    }

    pub(crate) async fn send_line(&mut self, line: &str) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        let data = format!("{line}\r\n");
        connection.send(data.as_bytes()).await
    }

    pub(crate) async fn read_reply(&mut self, expect: u16) -> Result<Reply> {
        loop {
            if let Some((reply, consumed)) = Reply::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                if !Reply::matches_expectation(reply.code, expect) {
                    return Err(ClientError::UnexpectedReply { reply });
                }
                return Ok(reply);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ReplyTooLarge(MAX_BUFFER_SIZE));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// The host component of a `host:port` address, with IPv6 brackets removed.
pub(crate) fn host_of(addr: &str) -> String {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_string()
}

/// Rejects any line containing CR or LF, per RFC 5321.
fn validate_line(line: &str) -> Result<()> {
    if line.contains(['\r', '\n']) {
        return Err(ClientError::Line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("mail.example.com:587"), "mail.example.com");
        assert_eq!(host_of("[::1]:25"), "::1");
        assert_eq!(host_of(":2525"), "");
        assert_eq!(host_of("bare-host"), "bare-host");
    }

    #[test]
    fn line_validation() {
        assert!(validate_line("example.com").is_ok());
        assert!(matches!(
            validate_line("evil\r\nMAIL FROM:<x>"),
            Err(ClientError::Line)
        ));
        assert!(matches!(validate_line("bad\nname"), Err(ClientError::Line)));
    }
}
