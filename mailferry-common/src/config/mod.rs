//! Configuration surface consumed by embedders.
//!
//! The engine does not read configuration files itself; callers deserialise
//! these structures from whatever source they use and hand them in.

mod timeouts;
mod tls;

pub use timeouts::Timeouts;
pub use tls::TlsContext;
