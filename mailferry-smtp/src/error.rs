//! Error types for the relay engine.

use std::io;

use thiserror::Error;

use crate::client::error::ClientError;
use crate::reply::Reply;

/// Errors on the downstream transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error while reading or writing the downstream leg.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The downstream peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

/// Errors during TLS setup on the downstream leg.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS error: {0}")]
    Rustls(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors surfaced by a relay session while talking to its upstream.
///
/// Every variant knows how to render itself as the reply the downstream
/// client must see: real upstream replies travel unmodified, and anything
/// that failed before the upstream produced a reply becomes a synthetic
/// 599 carrying the error text.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream exchange failed.
    #[error("upstream client error: {0}")]
    Client(#[from] ClientError),

    /// The backend could not establish an upstream session.
    #[error("backend initialisation failed: {0}")]
    Init(#[source] ClientError),

    /// Streaming the message body through the copier failed.
    #[error("message copy failed: {0}")]
    Copy(#[from] io::Error),
}

impl RelayError {
    /// The reply to surface downstream for this failure.
    #[must_use]
    pub fn downstream_reply(&self) -> Reply {
        match self {
            // A reply with an unexpected class is still a real upstream
            // reply: forward its code and text verbatim.
            Self::Client(ClientError::UnexpectedReply { reply }) => reply.clone(),
            // CR or LF in an argument is rejected before anything is
            // sent; this one is a 421, not a transport 599.
            Self::Client(err @ ClientError::Line) => {
                Reply::new(421, err.to_string()).with_enhanced((4, 0, 0))
            }
            other => Reply::from_upstream(599, &other.to_string()),
        }
    }
}
