//! The contract binding a downstream connection to its upstream leg.
//!
//! A [`Backend`] is the session factory; it owns the upstream dial. A
//! [`Session`] relays one downstream connection's commands for its whole
//! lifetime. Every reply travels back as a [`Reply`] so codes, enhanced
//! codes and text reach the downstream client untouched.

use async_trait::async_trait;
use tokio::io::AsyncBufRead;

use crate::error::RelayError;
use crate::reply::Reply;

/// The result of greeting the upstream: its advertised capabilities plus
/// the raw reply.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub capabilities: Vec<String>,
    pub reply: Reply,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates a session, called on the first downstream HELO/EHLO. This is
    /// where the upstream connection is established.
    async fn init(&self) -> Result<Box<dyn Session>, RelayError>;
}

/// One relayed conversation. The passthrough family all defaults to
/// [`Session::passthru`]; implementations override individual verbs only
/// when they need to observe them.
#[async_trait]
pub trait Session: Send {
    /// Greets the upstream on behalf of the downstream client and reports
    /// the upstream's capabilities.
    async fn greet(&mut self, verb: &str) -> Result<Greeting, RelayError>;

    /// Upgrades the upstream leg to TLS and returns the raw 220 reply.
    async fn start_tls(&mut self) -> Result<Reply, RelayError>;

    /// Forwards one command line upstream and returns the reply. `cmd` and
    /// `arg` are joined with a space when `arg` is non-empty; `expect` 0
    /// accepts any reply class.
    async fn passthru(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError>;

    async fn auth(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    async fn mail(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    async fn rcpt(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    async fn reset(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    async fn quit(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    async fn unknown(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        self.passthru(expect, cmd, arg).await
    }

    /// Starts the upstream DATA exchange and returns its 354 go-ahead.
    async fn data_command(&mut self) -> Result<Reply, RelayError>;

    /// Streams the dot-decoded body from `src` upstream and returns the
    /// final reply.
    async fn data(
        &mut self,
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<Reply, RelayError>;
}
