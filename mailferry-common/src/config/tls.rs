use std::path::PathBuf;

use serde::Deserialize;

/// Paths to the PEM certificate chain and private key that a listener uses
/// to accept STARTTLS upgrades from downstream clients.
#[derive(Clone, Debug, Deserialize)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}
