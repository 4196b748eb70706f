//! Mock upstream SMTP server for relay tests.
//!
//! Builder-configurable replies, scripted multi-step AUTH, optional
//! STARTTLS with a self-signed certificate, and capture of received
//! commands and message bodies for verification.
#![allow(dead_code)] // Test utility; not every knob is used in every test.

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

#[derive(Clone)]
struct MockConfig {
    greeting: (u16, String),
    /// EHLO capability lines before STARTTLS.
    capabilities: Vec<String>,
    /// EHLO capability lines after a successful STARTTLS.
    tls_capabilities: Vec<String>,
    helo: (u16, String),
    mail: (u16, String),
    rcpt: (u16, String),
    data: (u16, String),
    data_end: (u16, String),
    quit: (u16, String),
    unknown: (u16, String),
    /// Replies for an AUTH dialog; 3xx steps read one more client line.
    auth_script: Vec<(u16, String)>,
    tls: Option<(PathBuf, PathBuf)>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            greeting: (220, "mock.example.com ESMTP ready".into()),
            capabilities: vec!["PIPELINING".into(), "8BITMIME".into(), "ENHANCEDSTATUSCODES".into()],
            tls_capabilities: vec![
                "PIPELINING".into(),
                "8BITMIME".into(),
                "ENHANCEDSTATUSCODES".into(),
                "AUTH LOGIN PLAIN".into(),
            ],
            helo: (250, "mock.example.com at your service".into()),
            mail: (250, "2.0.0 mock".into()),
            rcpt: (250, "2.1.5 mock".into()),
            data: (354, "OK mock, send the dot".into()),
            data_end: (250, "2.0.0 OK mock got your dot".into()),
            quit: (221, "2.0.0 mock says bye".into()),
            unknown: (501, "5.5.2 mock does not understand".into()),
            auth_script: vec![(235, "2.7.0 mock authentication succeeded".into())],
            tls: None,
        }
    }
}

/// What the mock saw: every command line, and each DATA body (unstuffed,
/// CRLF line endings, without the terminator).
#[derive(Default)]
pub struct Observed {
    pub commands: Vec<String>,
    pub bodies: Vec<Vec<u8>>,
}

pub struct MockUpstream {
    addr: SocketAddr,
    observed: Arc<Mutex<Observed>>,
}

impl MockUpstream {
    pub fn builder() -> MockUpstreamBuilder {
        MockUpstreamBuilder {
            config: MockConfig::default(),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub async fn commands(&self) -> Vec<String> {
        self.observed.lock().await.commands.clone()
    }

    pub async fn bodies(&self) -> Vec<Vec<u8>> {
        self.observed.lock().await.bodies.clone()
    }

    async fn handle_client(
        stream: TcpStream,
        config: MockConfig,
        observed: Arc<Mutex<Observed>>,
    ) -> std::io::Result<()> {
        let mut stream: Box<dyn AsyncStream> = Box::new(stream);
        write_reply(&mut stream, config.greeting.0, &config.greeting.1).await?;
        let mut secure = false;

        loop {
            let Some(line) = read_line(&mut stream).await? else {
                return Ok(());
            };
            observed.lock().await.commands.push(line.clone());

            let verb = line
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_ascii_uppercase();

            match verb.as_str() {
                "EHLO" => {
                    let caps = if secure {
                        &config.tls_capabilities
                    } else {
                        &config.capabilities
                    };
                    let mut lines = vec!["mock.example.com greets you".to_string()];
                    lines.extend(caps.iter().cloned());
                    if config.tls.is_some() && !secure {
                        lines.push("STARTTLS".to_string());
                    }
                    write_multiline(&mut stream, 250, &lines).await?;
                }
                "HELO" => write_reply(&mut stream, config.helo.0, &config.helo.1).await?,
                "MAIL" => write_reply(&mut stream, config.mail.0, &config.mail.1).await?,
                "RCPT" => write_reply(&mut stream, config.rcpt.0, &config.rcpt.1).await?,
                "RSET" => write_reply(&mut stream, 250, "2.0.0 mock reset").await?,
                "AUTH" => {
                    for (i, (code, msg)) in config.auth_script.iter().enumerate() {
                        write_reply(&mut stream, *code, msg).await?;
                        let is_last = i + 1 == config.auth_script.len();
                        if !is_last && (300..400).contains(code) {
                            match read_line(&mut stream).await? {
                                Some(step) => observed.lock().await.commands.push(step),
                                None => return Ok(()),
                            }
                        }
                    }
                }
                "DATA" => {
                    write_reply(&mut stream, config.data.0, &config.data.1).await?;
                    if config.data.0 == 354 {
                        let mut body = Vec::new();
                        loop {
                            let Some(line) = read_line(&mut stream).await? else {
                                return Ok(());
                            };
                            if line == "." {
                                break;
                            }
                            let unstuffed = line.strip_prefix('.').map_or(line.as_str(), |r| {
                                if line.starts_with("..") { r } else { line.as_str() }
                            });
                            body.extend_from_slice(unstuffed.as_bytes());
                            body.extend_from_slice(b"\r\n");
                        }
                        observed.lock().await.bodies.push(body);
                        write_reply(&mut stream, config.data_end.0, &config.data_end.1).await?;
                    }
                }
                "STARTTLS" => match &config.tls {
                    None => {
                        write_reply(&mut stream, 502, "5.5.1 mock has no TLS").await?;
                    }
                    Some((cert, key)) => {
                        write_reply(&mut stream, 220, "2.0.0 mock ready to talk TLS").await?;
                        let acceptor = tls_acceptor(cert, key)?;
                        stream = Box::new(acceptor.accept(stream).await?);
                        secure = true;
                    }
                },
                "QUIT" => {
                    write_reply(&mut stream, config.quit.0, &config.quit.1).await?;
                    return Ok(());
                }
                _ => write_reply(&mut stream, config.unknown.0, &config.unknown.1).await?,
            }
        }
    }
}

pub struct MockUpstreamBuilder {
    config: MockConfig,
}

impl MockUpstreamBuilder {
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = (code, message.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn with_tls_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.config.tls_capabilities = capabilities;
        self
    }

    pub fn with_mail_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail = (code, message.into());
        self
    }

    pub fn with_rcpt_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt = (code, message.into());
        self
    }

    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data = (code, message.into());
        self
    }

    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = (code, message.into());
        self
    }

    pub fn with_unknown_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.unknown = (code, message.into());
        self
    }

    /// Replies for a multi-step AUTH dialog; each 3xx step waits for one
    /// more line from the client before the next reply.
    pub fn with_auth_script(mut self, script: Vec<(u16, String)>) -> Self {
        self.config.auth_script = script;
        self
    }

    /// Advertise and accept STARTTLS using the given PEM pair.
    pub fn with_tls(mut self, certificate: PathBuf, key: PathBuf) -> Self {
        self.config.tls = Some((certificate, key));
        self
    }

    /// Binds a random local port and starts serving.
    pub async fn build(self) -> std::io::Result<MockUpstream> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let observed = Arc::new(Mutex::new(Observed::default()));

        let config = self.config;
        let observed_clone = Arc::clone(&observed);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    return;
                };
                let config = config.clone();
                let observed = Arc::clone(&observed_clone);
                tokio::spawn(async move {
                    if let Err(e) = MockUpstream::handle_client(stream, config, observed).await {
                        eprintln!("mock upstream client error: {e}");
                    }
                });
            }
        });

        Ok(MockUpstream { addr, observed })
    }
}

async fn write_reply(
    stream: &mut Box<dyn AsyncStream>,
    code: u16,
    message: &str,
) -> std::io::Result<()> {
    let line = format!("{code} {message}\r\n");
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await
}

async fn write_multiline(
    stream: &mut Box<dyn AsyncStream>,
    code: u16,
    lines: &[String],
) -> std::io::Result<()> {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        out.push_str(&format!("{code}{sep}{line}\r\n"));
    }
    stream.write_all(out.as_bytes()).await?;
    stream.flush().await
}

/// Reads one CRLF line byte-wise. `None` on a clean EOF at a line start.
async fn read_line(stream: &mut Box<dyn AsyncStream>) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(if line.is_empty() { None } else { Some(to_string(line)) });
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(to_string(line)));
        }
        line.push(byte[0]);
    }
}

fn to_string(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn tls_acceptor(cert: &PathBuf, key: &PathBuf) -> std::io::Result<TlsAcceptor> {
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut StdBufReader::new(File::open(cert)?)).collect::<Result<_, _>>()?;
    let key: PrivateKeyDer<'static> = match rustls_pemfile::read_one(&mut StdBufReader::new(
        File::open(key)?,
    ))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => PrivateKeyDer::Pkcs1(key),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => PrivateKeyDer::Pkcs8(key),
        Some(rustls_pemfile::Item::Sec1Key(key)) => PrivateKeyDer::Sec1(key),
        _ => return Err(std::io::Error::other("unsupported key format")),
    };
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(std::io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
