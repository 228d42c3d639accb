//! TLS termination for the API listener

use std::path::Path;
use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;

/// rustls refuses to build a server config until a process-wide crypto
/// provider is chosen. Safe to call more than once.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Certificate chain and private key, both PEM
pub async fn load(cert: &Path, key: &Path) -> Result<RustlsConfig> {
    install_crypto_provider();
    RustlsConfig::from_pem_file(cert, key)
        .await
        .with_context(|| format!("Failed to load TLS material from {} / {}", cert.display(), key.display()))
}
