//! Error types for the upstream SMTP client.

use std::io;

use thiserror::Error;

use crate::reply::{Reply, ReplyParseError};

/// Errors that can occur while driving the upstream leg.
#[derive(Debug, Error)]
pub enum ClientError {
    /// IO error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP reply from the server.
    #[error("failed to parse SMTP reply: {0}")]
    Parse(#[from] ReplyParseError),

    /// The server replied with a code outside the expected class. The full
    /// reply is carried so it can be forwarded downstream verbatim.
    #[error("unexpected SMTP reply: {} {}", reply.code, reply.message())]
    UnexpectedReply { reply: Reply },

    /// A command argument contained CR or LF.
    #[error("smtp: a line must not contain CR or LF")]
    Line,

    /// TLS setup failed on the upstream leg.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The upstream closed the connection.
    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    /// A reply grew past the client's buffer limit.
    #[error("reply too large (exceeds {0} bytes)")]
    ReplyTooLarge(usize),
}

impl ClientError {
    /// The reply code associated with this error, when one is defined: an
    /// unexpected reply carries the upstream's actual code, and a line
    /// validation failure is fixed at 421. Transport-level failures have
    /// none; callers synthesise 599 for those.
    #[must_use]
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::UnexpectedReply { reply } => Some(reply.code),
            Self::Line => Some(421),
            _ => None,
        }
    }
}

/// Specialized `Result` type for upstream client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_code_extraction() {
        let err = ClientError::UnexpectedReply {
            reply: Reply::from_upstream(421, "4.3.2 shutting down"),
        };
        assert_eq!(err.reply_code(), Some(421));

        assert_eq!(ClientError::ConnectionClosed.reply_code(), None);
        // Line validation is rejected before send with a fixed 421.
        assert_eq!(ClientError::Line.reply_code(), Some(421));
    }

    #[test]
    fn line_error_display() {
        assert_eq!(
            ClientError::Line.to_string(),
            "smtp: a line must not contain CR or LF"
        );
    }
}
