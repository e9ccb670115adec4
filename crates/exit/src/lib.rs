//! Veilgate Exit
//!
//! The exit holds the OHTTP private key: it decrypts tunneled requests,
//! speaks plaintext HTTP to the configured AI backend, and re-encrypts
//! responses. It dials the relay over a reverse tunnel, so it needs no
//! public address and never learns who is calling.

mod backend;
mod handler;
mod tunnel;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use veilgate_core::tls::TlsError;
use veilgate_crypto::{CryptoError, KeyPair};
use veilgate_protocol::ProtocolError;

pub use backend::{is_hop_by_hop, is_sse_content_type, AiClient};
pub use handler::OhttpHandler;
pub use tunnel::{RelayCandidate, RelayDiscovery, TunnelClient, TunnelConfig};

#[derive(Error, Debug)]
pub enum ExitError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("backend request failed: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("backend returned error status {status}")]
    BackendStatus { status: u16 },

    #[error("backend response headers timed out")]
    BackendTimeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid relay address: {0}")]
    InvalidRelayAddr(String),

    #[error("no relay available")]
    NoRelayAvailable,

    #[error("relay rejected registration")]
    RegisterRejected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tls setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExitError>;

/// Exit node configuration.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Relay to dial (static mode).
    pub relay_addr: String,
    /// AI backend base URL, e.g. `https://api.openai.com`.
    pub backend_url: String,
    /// Injected as `Authorization: Bearer <key>` unless custom headers
    /// are configured.
    pub api_key: Option<String>,
    /// Custom headers; these replace matching incoming headers and
    /// suppress API-key injection.
    pub headers: HashMap<String, String>,
    pub tunnel: TunnelConfig,
}

/// Composition root: keys + backend client + OHTTP handler + tunnel.
pub struct ExitNode {
    tunnel: Arc<TunnelClient>,
    pub_key_hash: String,
}

impl ExitNode {
    pub fn new(config: ExitConfig, keys: &KeyPair) -> Result<Self> {
        let backend = AiClient::new(&config.backend_url, config.api_key, config.headers)?;
        let handler = Arc::new(OhttpHandler::new(
            keys.key_id(),
            &keys.private_bytes(),
            keys.public_key(),
            backend,
        )?);

        let pub_key_hash = keys.pub_key_hash();
        let tunnel = Arc::new(TunnelClient::new_static(
            config.relay_addr,
            pub_key_hash.clone(),
            keys.key_config(),
            handler,
            config.tunnel,
        )?);

        Ok(Self {
            tunnel,
            pub_key_hash,
        })
    }

    /// Exit node using a discovery collaborator instead of a static relay.
    pub fn with_discovery(
        discovery: Arc<dyn RelayDiscovery>,
        config: ExitConfig,
        keys: &KeyPair,
    ) -> Result<Self> {
        let backend = AiClient::new(&config.backend_url, config.api_key, config.headers)?;
        let handler = Arc::new(OhttpHandler::new(
            keys.key_id(),
            &keys.private_bytes(),
            keys.public_key(),
            backend,
        )?);

        let pub_key_hash = keys.pub_key_hash();
        let tunnel = Arc::new(TunnelClient::with_discovery(
            discovery,
            pub_key_hash.clone(),
            keys.key_config(),
            handler,
            config.tunnel,
        )?);

        Ok(Self {
            tunnel,
            pub_key_hash,
        })
    }

    pub fn start(&self) {
        Arc::clone(&self.tunnel).start();
    }

    /// Resolves after the first successful registration.
    pub async fn ready(&self) {
        self.tunnel.ready().await;
    }

    pub async fn stop(&self) {
        self.tunnel.stop().await;
    }

    pub fn pub_key_hash(&self) -> &str {
        &self.pub_key_hash
    }
}
