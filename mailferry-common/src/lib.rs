pub mod config;
pub mod logging;

pub use tracing;

/// Control messages broadcast to listeners and their sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
