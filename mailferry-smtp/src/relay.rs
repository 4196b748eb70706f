//! The transparent relay backend: one upstream [`Client`] per downstream
//! connection, every command forwarded verbatim, every reply returned
//! verbatim. Failures that precede an upstream reply surface as synthetic
//! 599s via [`RelayError::downstream_reply`].

use std::sync::Arc;

use async_trait::async_trait;
use mailferry_common::{internal, upstream};
use tokio::io::AsyncBufRead;

use crate::backend::{Backend, Greeting, Session};
use crate::client::{Client, TlsOptions, host_of};
use crate::error::RelayError;
use crate::mime::{IdentityWrapper, Wrapper, copy_message};
use crate::reply::Reply;

/// Local name advertised upstream when the configured address has no host
/// component (e.g. `:2525`).
const FALLBACK_LOCAL_NAME: &str = "mailferry.localhost";

/// Relay backend configuration plus session factory.
pub struct RelayBackend {
    upstream_addr: String,
    verbose: bool,
    insecure_skip_verify: bool,
    wrapper: Arc<dyn Wrapper>,
}

impl RelayBackend {
    pub fn new(upstream_addr: impl Into<String>) -> Self {
        Self {
            upstream_addr: upstream_addr.into(),
            verbose: false,
            insecure_skip_verify: false,
            wrapper: Arc::new(IdentityWrapper),
        }
    }

    /// Log full per-command detail instead of the one-line DATA summary.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Skip certificate verification on the upstream STARTTLS leg.
    #[must_use]
    pub fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Installs the HTML-rewriting policy applied during DATA.
    #[must_use]
    pub fn with_wrapper(mut self, wrapper: Arc<dyn Wrapper>) -> Self {
        self.wrapper = wrapper;
        self
    }
}

#[async_trait]
impl Backend for RelayBackend {
    async fn init(&self) -> Result<Box<dyn Session>, RelayError> {
        internal!(level = DEBUG, "connecting upstream {}", self.upstream_addr);
        let client = match Client::connect(&self.upstream_addr).await {
            Ok(client) => client,
            Err(err) => {
                internal!(
                    level = ERROR,
                    "upstream connection to {} failed: {err}",
                    self.upstream_addr
                );
                return Err(RelayError::Init(err));
            }
        };
        internal!(level = DEBUG, "connected upstream {}", self.upstream_addr);

        Ok(Box::new(RelaySession {
            client,
            upstream_addr: self.upstream_addr.clone(),
            verbose: self.verbose,
            insecure_skip_verify: self.insecure_skip_verify,
            wrapper: Arc::clone(&self.wrapper),
        }))
    }
}

struct RelaySession {
    client: Client,
    upstream_addr: String,
    verbose: bool,
    insecure_skip_verify: bool,
    wrapper: Arc<dyn Wrapper>,
}

impl RelaySession {
    /// Flow markers in the style of swaks: `~>`/`<~` once the upstream leg
    /// is secure, `->`/`<-` before.
    fn cmd_marker(&self) -> &'static str {
        if self.client.is_tls() { "~>" } else { "->" }
    }

    fn resp_marker(&self) -> &'static str {
        if self.client.is_tls() { "<~" } else { "<-" }
    }

    fn upstream_host(&self) -> String {
        let host = host_of(&self.upstream_addr);
        if host.is_empty() {
            FALLBACK_LOCAL_NAME.to_string()
        } else {
            host
        }
    }
}

#[async_trait]
impl Session for RelaySession {
    async fn greet(&mut self, verb: &str) -> Result<Greeting, RelayError> {
        upstream!(send, level = DEBUG, "{} {verb}", self.cmd_marker());
        let host = self.upstream_host();
        match self.client.hello(&host).await {
            Err(err) => {
                upstream!(recv, level = WARN, "{} {verb} error: {err}", self.resp_marker());
                Err(err.into())
            }
            Ok(reply) => {
                upstream!(recv, level = DEBUG, "{} {verb} success", self.resp_marker());
                let capabilities = self.client.capabilities();
                internal!(level = DEBUG, "upstream capabilities: {capabilities:?}");
                Ok(Greeting { capabilities, reply })
            }
        }
    }

    async fn start_tls(&mut self) -> Result<Reply, RelayError> {
        let host = host_of(&self.upstream_addr);
        let opts = TlsOptions {
            server_name: if host.is_empty() { None } else { Some(host) },
            insecure_skip_verify: self.insecure_skip_verify,
        };

        upstream!(send, level = DEBUG, "{} STARTTLS", self.cmd_marker());
        match self.client.starttls(&opts).await {
            Err(err) => {
                upstream!(recv, level = WARN, "{} STARTTLS error: {err}", self.resp_marker());
                Err(err.into())
            }
            Ok(reply) => {
                upstream!(
                    recv,
                    level = DEBUG,
                    "{} {} {}",
                    self.resp_marker(),
                    reply.code,
                    reply.message()
                );
                Ok(reply)
            }
        }
    }

    async fn passthru(&mut self, expect: u16, cmd: &str, arg: &str) -> Result<Reply, RelayError> {
        upstream!(send, level = DEBUG, "{} {cmd} {arg}", self.cmd_marker());
        let line = if arg.is_empty() {
            cmd.to_string()
        } else {
            format!("{cmd} {arg}")
        };

        match self.client.cmd(expect, &line).await {
            Err(err) => {
                upstream!(recv, level = WARN, "{} {cmd} error: {err}", self.resp_marker());
                Err(err.into())
            }
            Ok(reply) => {
                upstream!(
                    recv,
                    level = DEBUG,
                    "{} {} {}",
                    self.resp_marker(),
                    reply.code,
                    reply.message()
                );
                Ok(reply)
            }
        }
    }

    async fn data_command(&mut self) -> Result<Reply, RelayError> {
        upstream!(send, level = DEBUG, "{} DATA", self.cmd_marker());
        match self.client.data().await {
            Err(err) => {
                upstream!(recv, level = WARN, "{} DATA error: {err}", self.resp_marker());
                Err(err.into())
            }
            Ok(reply) => Ok(reply),
        }
    }

    async fn data(
        &mut self,
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<Reply, RelayError> {
        let marker = self.resp_marker();
        let wrapper = Arc::clone(&self.wrapper);
        let mut sink = self.client.body_sink();

        match copy_message(&mut sink, src, wrapper.as_ref()).await {
            Err(err) => {
                internal!(level = ERROR, "DATA copy failed: {err}");
                Err(RelayError::Copy(err))
            }
            Ok(bytes) => {
                let reply = sink.finish().await.map_err(|err| {
                    internal!(level = ERROR, "DATA close failed: {err}");
                    RelayError::from(err)
                })?;

                if self.verbose {
                    upstream!(
                        recv,
                        level = DEBUG,
                        "{marker} DATA accepted, bytes written = {bytes}"
                    );
                } else {
                    internal!(
                        level = INFO,
                        "message data relayed, bytes={bytes}, code={}, msg={}",
                        reply.code,
                        reply.message()
                    );
                }
                Ok(reply)
            }
        }
    }
}
