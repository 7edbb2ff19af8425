//! Inbound TLS configuration.
//!
//! Builds a rustls `ServerConfig` that requires and verifies client
//! certificates against the configured CA bundle. Certificate material is
//! read once at startup; rotation requires a restart.

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use crate::core::config::TlsConfig;

/// Load a PEM certificate chain from disk.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let chain: Vec<_> = certs(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
    if chain.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(chain)
}

/// Load a PEM private key from disk.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key in {}", path.display()))?
        .with_context(|| format!("No private key found in {}", path.display()))
}

/// Build the server-side TLS configuration with mandatory client
/// certificate verification against the configured CA bundle.
pub fn build_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    let cert_chain = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(&config.client_ca_path)? {
        roots
            .add(ca)
            .context("Failed to add client CA certificate to trust store")?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("Failed to build client certificate verifier")?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)
        .context("Invalid server certificate or key")?;

    Ok(Arc::new(server_config))
}
