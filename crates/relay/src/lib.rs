//! Veilgate Relay
//!
//! The relay fronts the network: exits dial in and register reverse
//! tunnels, clients send encrypted requests routed by exit public-key
//! hash. The relay can neither read forwarded payloads nor learn backend
//! addresses.

mod registry;
mod server;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quinn::{Connection, Endpoint};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use veilgate_core::tls::{self_signed_server_config, TlsError};
use veilgate_protocol::{EXIT_ALPN, RELAY_ALPN};

pub use registry::{Registry, RegistryConn, REASON_HEARTBEAT_TIMEOUT, REASON_REPLACED};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    /// Name placed in the self-signed certificate.
    pub server_name: String,
    /// Entries whose last heartbeat is older than this are evicted.
    pub heartbeat_ttl: Duration,
    /// Deadline for opening a forward stream on an exit connection.
    pub forward_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4433".parse().expect("valid default address"),
            server_name: "veilgate-relay".to_string(),
            heartbeat_ttl: Duration::from_secs(60),
            forward_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            max_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Relay node: QUIC server plus exit registry.
pub struct RelayNode {
    config: RelayConfig,
    registry: Arc<Registry<Connection>>,
    endpoint: Mutex<Option<Endpoint>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    cert_fingerprint: Mutex<Option<[u8; 32]>>,
}

impl RelayNode {
    pub fn new(config: RelayConfig) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            config,
            registry: Arc::new(Registry::new()),
            endpoint: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            ready_tx,
            ready_rx,
            cert_fingerprint: Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept and cleanup loops. The
    /// `Ready` signal fires once the listener is bound.
    pub async fn start(&self) -> Result<()> {
        let (tls_config, fingerprint) = self_signed_server_config(
            vec![self.config.server_name.clone()],
            &[RELAY_ALPN, EXIT_ALPN],
        )?;
        *self.cert_fingerprint.lock().unwrap() = Some(fingerprint);

        let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
        server_config.transport_config(Arc::new(server::transport_config(&self.config)));

        let endpoint = Endpoint::server(server_config, self.config.listen)?;
        let local_addr = endpoint.local_addr()?;
        info!("relay listening on {local_addr}");

        *self.endpoint.lock().unwrap() = Some(endpoint.clone());

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(server::accept_loop(
            endpoint,
            Arc::clone(&self.registry),
            self.config.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(server::cleanup_loop(
            Arc::clone(&self.registry),
            self.config.heartbeat_ttl,
            self.cancel.clone(),
        )));
        drop(tasks);

        self.ready_tx.send_replace(true);
        Ok(())
    }

    /// Resolves once the listener is bound; embedders sequence exit
    /// startup after this.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Cancel everything, close the endpoint, and join all handlers.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(endpoint) = self.endpoint.lock().unwrap().take() {
            endpoint.close(quinn::VarInt::from_u32(0), b"relay shutting down");
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("relay stopped");
    }

    /// Bound address, available after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|e| e.local_addr().ok())
    }

    /// SHA-256 fingerprint of the serving certificate, for pinning.
    pub fn cert_fingerprint(&self) -> Option<[u8; 32]> {
        *self.cert_fingerprint.lock().unwrap()
    }

    /// Registry access for embedders and tests.
    pub fn registry(&self) -> &Arc<Registry<Connection>> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen.port(), 4433);
        assert_eq!(config.heartbeat_ttl, Duration::from_secs(60));
        assert_eq!(config.forward_timeout, Duration::from_secs(30));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_start_binds_and_signals_ready() {
        let node = RelayNode::new(RelayConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        });
        node.start().await.unwrap();
        node.ready().await;

        let addr = node.local_addr().expect("bound address");
        assert_ne!(addr.port(), 0);
        assert!(node.cert_fingerprint().is_some());

        node.stop().await;
    }
}
