//! A bare-bones downstream SMTP client for poking the relay in tests.
#![allow(dead_code)] // Test utility; not every helper is used in every test.

use std::sync::Arc;

use mailferry_smtp::Reply;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub struct TestClient {
    stream: Box<dyn AsyncStream>,
    buffer: Vec<u8>,
}

impl TestClient {
    /// Connects and reads the 220 greeting.
    pub async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to relay");
        let mut client = Self {
            stream: Box::new(stream),
            buffer: Vec::new(),
        };
        let greeting = client.read_reply().await;
        assert_eq!(greeting.code, 220, "unexpected greeting {greeting:?}");
        client
    }

    pub async fn send_line(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to relay");
        self.stream.flush().await.expect("flush to relay");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to relay");
        self.stream.flush().await.expect("flush to relay");
    }

    /// Reads one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> Reply {
        loop {
            if let Some((reply, consumed)) =
                Reply::parse_response(&self.buffer).expect("well-formed reply")
            {
                self.buffer.drain(..consumed);
                return reply;
            }
            let mut chunk = [0u8; 4096];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .expect("read from relay");
            assert!(n > 0, "relay closed mid-reply; buffered: {:?}", self.buffer);
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends a command and returns its reply.
    pub async fn cmd(&mut self, line: &str) -> Reply {
        self.send_line(line).await;
        self.read_reply().await
    }

    /// True when the relay has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut chunk = [0u8; 64];
        match self.stream.read(&mut chunk).await {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => true,
        }
    }

    /// Upgrades the transport to TLS without verifying the certificate.
    /// Call after STARTTLS returned 220.
    pub async fn upgrade_insecure(&mut self, server_name: &str) {
        assert!(self.buffer.is_empty(), "unread bytes before TLS handshake");

        let mut config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAny));

        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(server_name.to_string()).expect("server name");

        let stream = std::mem::replace(
            &mut self.stream,
            Box::new(tokio::io::duplex(1).0), // placeholder, replaced below
        );
        let tls = connector
            .connect(name, stream)
            .await
            .expect("downstream TLS handshake");
        self.stream = Box::new(tls);
    }
}

/// Certificate verification disabled; the tests pin nothing.
#[derive(Debug)]
struct AcceptAny;

impl ServerCertVerifier for AcceptAny {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
