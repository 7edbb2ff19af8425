//! Mutual-TLS accept loop.
//!
//! axum's stock `serve` cannot surface the peer certificate, so TLS mode
//! accepts connections manually: each TCP connection is handshaked with
//! tokio-rustls, the caller identity is derived from the verified client
//! certificate, and the connection is then served by hyper with the
//! identity injected as a request extension. A semaphore bounds concurrent
//! connections so a flood degrades into queueing instead of memory growth.

use anyhow::{Context, Result};
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;

use crate::security::identity::{common_name_from_cert, CallerDirectory, CallerIdentity};

/// Accept and serve mutual-TLS connections until the process exits.
pub async fn serve_tls(
    app: Router,
    addr: SocketAddr,
    tls_config: Arc<rustls::ServerConfig>,
    directory: Arc<CallerDirectory>,
    max_connections: usize,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let acceptor = TlsAcceptor::from(tls_config);
    let semaphore = Arc::new(Semaphore::new(max_connections.max(1)));

    tracing::info!(%addr, max_connections, "Listening with mutual TLS");

    loop {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("Connection semaphore closed")?;

        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let directory = directory.clone();
        tokio::spawn(async move {
            // Permit held for the connection's lifetime
            let _permit = permit;
            if let Err(e) = serve_connection(stream, peer_addr, acceptor, app, directory).await {
                tracing::debug!(%peer_addr, error = %e, "Connection closed with error");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    directory: Arc<CallerDirectory>,
) -> Result<()> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;

    let identity = identity_from_connection(&tls_stream, &directory)?;
    tracing::debug!(%peer_addr, caller = %identity.name, "Client certificate verified");

    let service = TowerToHyperService::new(app.layer(Extension(identity)));
    ConnBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

fn identity_from_connection(
    tls_stream: &tokio_rustls::server::TlsStream<TcpStream>,
    directory: &CallerDirectory,
) -> Result<CallerIdentity> {
    let (_, session) = tls_stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .context("Client presented no certificate")?;
    let cn = common_name_from_cert(leaf).context("Client certificate has no subject CN")?;
    directory
        .identity_from_cn(&cn)
        .map_err(|_| anyhow::anyhow!("Caller '{}' is disabled", cn))
}
