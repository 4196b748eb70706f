//! A transparent SMTP relay engine.
//!
//! Each downstream submission gets its own upstream conversation: commands
//! are forwarded verbatim, replies come back verbatim, and STARTTLS
//! upgrades the upstream leg before the downstream one. During DATA an
//! optional [`Wrapper`] may rewrite `text/html` MIME leaves in a streaming
//! fashion; by default mail passes through byte for byte.
//!
//! The engine never rewrites upstream reply codes or text. The only
//! synthetic codes are 599 (a transport failure before any upstream
//! reply) and the fixed engine replies for framing errors, timeouts, and
//! panics.

pub mod backend;
pub mod client;
mod connection;
mod data;
pub mod error;
mod handler;
pub mod linesplit;
pub mod mime;
pub mod relay;
pub mod reply;
pub mod server;

pub use backend::{Backend, Greeting, Session};
pub use client::{Client, TlsOptions};
pub use connection::DebugSink;
pub use mime::{HeaderMap, IdentityWrapper, Wrapper, copy_message};
pub use relay::RelayBackend;
pub use reply::{Enhanced, Reply};
pub use server::{DEFAULT_CAPABILITIES, Server, ServerBuilder};
