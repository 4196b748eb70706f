//! Shared scaffolding for relay integration tests.

pub mod client;
pub mod mock_server;

use std::path::PathBuf;

use mailferry_common::config::TlsContext;

/// Path to a file in the checked-in test data directory.
pub fn testdata(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/support/testdata")
        .join(name)
}

/// The self-signed certificate pair used on both legs in TLS tests.
pub fn tls_context() -> TlsContext {
    TlsContext {
        certificate: testdata("cert.pem"),
        key: testdata("key.pem"),
    }
}
