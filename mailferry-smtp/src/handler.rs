//! The per-connection downstream state machine: read a command line,
//! dispatch it, relay the reply. STARTTLS choreography, the DATA phase,
//! and panic isolation all live here.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use mailferry_common::{downstream, internal};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::connection::Connection;
use crate::data::DotReader;
use crate::error::ConnectionError;
use crate::reply::{Enhanced, Reply};
use crate::server::ServerShared;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub(crate) struct Handler<Stream> {
    conn: Option<Connection<Stream>>,
    shared: Arc<ServerShared>,
    peer: SocketAddr,
    helo: String,
    errors: usize,
    session: Option<Box<dyn crate::backend::Session>>,
    /// The capability set advertised on EHLO. Seeded with the engine's
    /// base set and replaced by the upstream's on each greeting.
    caps: Vec<String>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Handler<Stream> {
    pub(crate) fn new(stream: Stream, peer: SocketAddr, shared: Arc<ServerShared>) -> Self {
        let conn = Connection::new(stream, shared.debug.clone());
        Self {
            conn: Some(conn),
            shared,
            peer,
            helo: String::new(),
            errors: 0,
            session: None,
            caps: crate::server::DEFAULT_CAPABILITIES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub(crate) async fn run(mut self) {
        internal!("connected: {}", self.peer);

        let greeting = Reply {
            code: 220,
            enhanced: Enhanced::Suppressed,
            lines: vec![format!("{} ESMTP Service Ready", self.shared.domain)],
        };
        if self.send_reply(&greeting).await.is_err() {
            return;
        }

        loop {
            let line = match self.read_command_line().await {
                Ok(line) => line,
                Err(()) => break,
            };
            downstream!(recv, "{line}");

            if line.is_empty() {
                let _ = self
                    .send_reply(&Reply::new(500, "Speak up").with_enhanced((5, 5, 2)))
                    .await;
                continue;
            }

            let (verb, arg) = match parse_command(&line) {
                Ok(parsed) => parsed,
                Err(()) => {
                    self.errors += 1;
                    if self
                        .send_reply(&Reply::new(501, "Bad command").with_enhanced((5, 5, 2)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            // A panic in a handler must never reach the listen loop: turn
            // it into a single 421 and drop the connection.
            let outcome =
                std::panic::AssertUnwindSafe(self.dispatch(&verb, &arg)).catch_unwind();
            match outcome.await {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Close)) | Ok(Err(_)) => break,
                Err(panic) => {
                    internal!(
                        level = ERROR,
                        "panic serving {}: {}",
                        self.peer,
                        panic_message(panic.as_ref())
                    );
                    let _ = self
                        .send_reply(
                            &Reply::new(421, "Internal server error").with_enhanced((4, 0, 0)),
                        )
                        .await;
                    break;
                }
            }
        }

        internal!("connection closed: {}", self.peer);
    }

    async fn dispatch(&mut self, verb: &str, arg: &str) -> Result<Flow, ConnectionError> {
        match verb {
            "HELO" | "EHLO" => self.handle_helo(verb, arg).await,
            "STARTTLS" => self.handle_starttls().await,
            "DATA" => self.handle_data().await,
            "QUIT" => {
                let flow = self.handle_passthru(verb, "").await?;
                Ok(match flow {
                    Flow::Continue => Flow::Close,
                    close => close,
                })
            }
            "RSET" => self.handle_passthru(verb, "").await,
            // AUTH, MAIL, RCPT, and anything unknown: let the upstream
            // server be the judge.
            _ => self.handle_passthru(verb, arg).await,
        }
    }

    async fn handle_helo(&mut self, verb: &str, arg: &str) -> Result<Flow, ConnectionError> {
        if arg.is_empty() {
            self.send_reply(
                &Reply::new(501, "Domain/address argument required").with_enhanced((5, 5, 2)),
            )
            .await?;
            return Ok(Flow::Continue);
        }
        self.helo = arg.to_string();

        if !self.ensure_session().await? {
            return Ok(Flow::Continue);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        match session.greet(verb).await {
            Err(err) => {
                self.send_reply(&err.downstream_reply()).await?;
                Ok(Flow::Continue)
            }
            Ok(greeting) => {
                if !greeting.capabilities.is_empty() {
                    let downstream_tls = self
                        .conn
                        .as_ref()
                        .is_some_and(Connection::is_tls);
                    self.caps = greeting
                        .capabilities
                        .into_iter()
                        .filter(|cap| {
                            // Offer STARTTLS downstream only when this
                            // server can actually accept the upgrade.
                            cap != "STARTTLS" || (self.shared.tls.is_some() && !downstream_tls)
                        })
                        .collect();
                }

                let reply = if verb == "HELO" {
                    Reply::new(250, format!("Hello {}", self.helo)).with_enhanced((2, 0, 0))
                } else {
                    let mut lines = vec![format!("Hello {}", self.helo)];
                    lines.extend(self.caps.iter().cloned());
                    Reply {
                        code: 250,
                        enhanced: Enhanced::Suppressed,
                        lines,
                    }
                };
                self.send_reply(&reply).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_starttls(&mut self) -> Result<Flow, ConnectionError> {
        if self.conn.as_ref().is_some_and(Connection::is_tls) {
            self.send_reply(
                &Reply::new(502, "Already running in TLS").with_enhanced((5, 5, 1)),
            )
            .await?;
            return Ok(Flow::Continue);
        }
        let Some(tls_context) = self.shared.tls.clone() else {
            self.send_reply(&Reply::new(502, "TLS not available").with_enhanced((5, 5, 1)))
                .await?;
            return Ok(Flow::Continue);
        };

        if !self.ensure_session().await? {
            return Ok(Flow::Continue);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        // The upstream leg upgrades first; its reply decides whether the
        // downstream handshake happens at all.
        match session.start_tls().await {
            Err(err) => {
                self.send_reply(&err.downstream_reply()).await?;
                Ok(Flow::Continue)
            }
            Ok(reply) => {
                self.send_reply(&reply).await?;

                let conn = self.conn.take().ok_or(ConnectionError::Closed)?;
                match conn.upgrade(&tls_context).await {
                    Ok(conn) => {
                        self.conn = Some(conn);
                        internal!("downstream connection upgraded to TLS: {}", self.peer);
                        Ok(Flow::Continue)
                    }
                    Err(failure) => {
                        internal!(
                            level = ERROR,
                            "downstream TLS handshake with {} failed: {}",
                            self.peer,
                            failure.error
                        );
                        match failure.connection {
                            Some(conn) => {
                                self.conn = Some(conn);
                                self.send_reply(
                                    &Reply::new(550, "Handshake error").with_enhanced((5, 0, 0)),
                                )
                                .await?;
                                Ok(Flow::Continue)
                            }
                            None => Ok(Flow::Close),
                        }
                    }
                }
            }
        }
    }

    /// Relays a command and keeps forwarding downstream lines through the
    /// same session callback until a terminal reply class appears. This is
    /// what lets multi-step AUTH dialogs tunnel through untouched.
    async fn handle_passthru(&mut self, verb: &str, arg: &str) -> Result<Flow, ConnectionError> {
        if !self.ensure_session().await? {
            return Ok(Flow::Continue);
        }

        let mut outcome = self.relay_command(verb, verb, arg).await;
        loop {
            match outcome {
                Err(err) => {
                    self.send_reply(&err.downstream_reply()).await?;
                    return Ok(Flow::Continue);
                }
                Ok(reply) => {
                    self.send_reply(&reply).await?;
                    if reply.is_success() || reply.is_permanent() {
                        return Ok(Flow::Continue);
                    }

                    let Ok(line) = self.read_command_line().await else {
                        return Ok(Flow::Close);
                    };
                    downstream!(recv, "{line}");
                    outcome = self.relay_command(verb, &line, "").await;
                }
            }
        }
    }

    async fn relay_command(
        &mut self,
        verb: &str,
        cmd: &str,
        arg: &str,
    ) -> Result<Reply, crate::error::RelayError> {
        let Some(session) = self.session.as_mut() else {
            // The session vanished underneath us; report it like any other
            // dead upstream transport.
            return Err(crate::error::RelayError::Client(
                crate::client::error::ClientError::ConnectionClosed,
            ));
        };
        match verb {
            "AUTH" => session.auth(0, cmd, arg).await,
            "MAIL" => session.mail(0, cmd, arg).await,
            "RCPT" => session.rcpt(0, cmd, arg).await,
            "RSET" => session.reset(0, cmd, arg).await,
            "QUIT" => session.quit(0, cmd, arg).await,
            _ => session.unknown(0, cmd, arg).await,
        }
    }

    async fn handle_data(&mut self) -> Result<Flow, ConnectionError> {
        if !self.ensure_session().await? {
            return Ok(Flow::Continue);
        }
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        let go_ahead = match session.data_command().await {
            Err(err) => {
                self.send_reply(&err.downstream_reply()).await?;
                return Ok(Flow::Continue);
            }
            Ok(reply) => reply,
        };
        self.send_reply(&go_ahead).await?;

        let read_timeout = self.shared.timeouts.read_timeout();
        let conn = self.conn.as_mut().ok_or(ConnectionError::Closed)?;
        let Some(session) = self.session.as_mut() else {
            return Ok(Flow::Continue);
        };

        let result = maybe_timeout(read_timeout, async {
            let mut dot_reader = DotReader::new(conn);
            let outcome = session.data(&mut BufReader::new(&mut dot_reader)).await;
            // Whatever happened upstream, the downstream body must be
            // consumed to the dot so framing survives for the next command.
            if !dot_reader.finished() {
                let _ = tokio::io::copy(&mut dot_reader, &mut tokio::io::sink()).await;
            }
            outcome
        })
        .await;

        match result {
            Ok(Ok(reply)) => {
                self.send_reply(&reply).await?;
                Ok(Flow::Continue)
            }
            Ok(Err(err)) => {
                self.send_reply(&err.downstream_reply()).await?;
                Ok(Flow::Continue)
            }
            Err(()) => {
                let _ = self
                    .send_reply(
                        &Reply::new(221, "Idle timeout, bye bye").with_enhanced((2, 4, 2)),
                    )
                    .await;
                Ok(Flow::Close)
            }
        }
    }

    /// Lazily creates the session. `false` means the backend failed and a
    /// 421 has already been sent.
    async fn ensure_session(&mut self) -> Result<bool, ConnectionError> {
        if self.session.is_some() {
            return Ok(true);
        }
        match self.shared.backend.init().await {
            Ok(session) => {
                self.session = Some(session);
                Ok(true)
            }
            Err(err) => {
                internal!(level = ERROR, "backend init for {} failed: {err}", self.peer);
                self.send_reply(
                    &Reply::new(421, "Internal server error").with_enhanced((4, 0, 0)),
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// Reads one command line under the idle deadline. `Err(())` means the
    /// connection is finished; any parting 221 has already been written.
    async fn read_command_line(&mut self) -> Result<String, ()> {
        let read_timeout = self.shared.timeouts.read_timeout();
        let conn = self.conn.as_mut().ok_or(())?;

        match maybe_timeout(read_timeout, conn.read_line()).await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(ConnectionError::Closed)) => Err(()),
            Ok(Err(ConnectionError::Io(err))) => {
                internal!(level = WARN, "read error from {}: {err}", self.peer);
                let _ = self
                    .send_reply(
                        &Reply::new(221, "Connection error, sorry").with_enhanced((2, 4, 0)),
                    )
                    .await;
                Err(())
            }
            Err(()) => {
                let _ = self
                    .send_reply(
                        &Reply::new(221, "Idle timeout, bye bye").with_enhanced((2, 4, 2)),
                    )
                    .await;
                Err(())
            }
        }
    }

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), ConnectionError> {
        let write_timeout = self.shared.timeouts.write_timeout();
        let conn = self.conn.as_mut().ok_or(ConnectionError::Closed)?;

        for line in reply.wire_lines() {
            downstream!(send, "{line}");
            match maybe_timeout(write_timeout, conn.write_line(&line)).await {
                Ok(result) => result?,
                Err(()) => {
                    return Err(ConnectionError::Io(io::ErrorKind::TimedOut.into()));
                }
            }
        }
        Ok(())
    }
}

/// Splits a raw command line into an upper-cased verb and its argument.
fn parse_command(line: &str) -> Result<(String, String), ()> {
    let (verb, arg) = match line.split_once(' ') {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line, ""),
    };
    if verb.is_empty() || !verb.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(());
    }
    Ok((verb.to_ascii_uppercase(), arg.to_string()))
}

async fn maybe_timeout<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = T>,
) -> Result<T, ()> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| ()),
        None => Ok(fut.await),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}
