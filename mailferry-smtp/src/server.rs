//! The listen loop: accept, spawn one task per downstream connection,
//! track live connections, and tear everything down on shutdown.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use mailferry_common::config::{TlsContext, Timeouts};
use mailferry_common::{Signal, internal};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::backend::Backend;
use crate::connection::DebugSink;
use crate::handler::Handler;

/// Extensions the engine itself guarantees, advertised before the first
/// upstream greeting replaces the set.
pub const DEFAULT_CAPABILITIES: [&str; 3] = ["PIPELINING", "8BITMIME", "ENHANCEDSTATUSCODES"];

/// Configuration shared by every connection of one server.
pub(crate) struct ServerShared {
    pub(crate) domain: String,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) tls: Option<TlsContext>,
    pub(crate) timeouts: Timeouts,
    pub(crate) debug: Option<DebugSink>,
}

/// A live downstream connection as seen from the registry.
pub struct ConnectionEntry {
    pub peer: SocketAddr,
    abort: Option<AbortHandle>,
}

type Registry = Arc<Mutex<HashMap<u64, ConnectionEntry>>>;

pub struct Server {
    shared: Arc<ServerShared>,
    shutdown: broadcast::Sender<Signal>,
    connections: Registry,
    next_id: AtomicU64,
}

impl Server {
    #[must_use]
    pub fn builder(backend: Arc<dyn Backend>) -> ServerBuilder {
        ServerBuilder::new(backend)
    }

    /// Binds `addr` and serves until [`Server::close`] is called or the
    /// listener fails.
    pub async fn listen(&self, addr: &str) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections off an existing listener, one task per
    /// connection.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        internal!(level = INFO, "serving on {}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "listener shutting down");
                        return Ok(());
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!("connection received from {peer}");

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    lock(&self.connections).insert(id, ConnectionEntry { peer, abort: None });

                    let shared = Arc::clone(&self.shared);
                    let connections = Arc::clone(&self.connections);
                    let task = tokio::spawn(async move {
                        Handler::new(stream, peer, shared).run().await;
                        lock(&connections).remove(&id);
                    });

                    if let Some(entry) = lock(&self.connections).get_mut(&id) {
                        entry.abort = Some(task.abort_handle());
                    }
                }
            }
        }
    }

    /// Stops the listen loop and closes every registered connection.
    pub fn close(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        for (_, entry) in lock(&self.connections).drain() {
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
    }

    /// Visits every live connection while holding the registry lock.
    pub fn for_each_connection(&self, mut f: impl FnMut(&ConnectionEntry)) {
        for entry in lock(&self.connections).values() {
            f(entry);
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, HashMap<u64, ConnectionEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ServerBuilder {
    domain: Option<String>,
    backend: Arc<dyn Backend>,
    tls: Option<TlsContext>,
    timeouts: Timeouts,
    debug: Option<DebugSink>,
}

impl ServerBuilder {
    fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            domain: None,
            backend,
            tls: None,
            timeouts: Timeouts::default(),
            debug: None,
        }
    }

    /// The name announced in the 220 greeting.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Certificate and key for downstream STARTTLS. Without this, STARTTLS
    /// is refused and filtered out of advertised capabilities.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Mirrors all raw downstream bytes, both directions, into `sink`.
    #[must_use]
    pub fn with_debug_sink(mut self, sink: DebugSink) -> Self {
        self.debug = Some(sink);
        self
    }

    #[must_use]
    pub fn build(self) -> Server {
        let (shutdown, _) = broadcast::channel(1);
        Server {
            shared: Arc::new(ServerShared {
                domain: self.domain.unwrap_or_else(|| {
                    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
                }),
                backend: self.backend,
                tls: self.tls,
                timeouts: self.timeouts,
                debug: self.debug,
            }),
            shutdown,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}
