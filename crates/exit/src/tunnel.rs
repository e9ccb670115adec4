//! Reverse tunnel to the relay
//!
//! The exit dials out, registers its pubKeyHash, then serves requests on
//! streams the relay opens back over the same connection, so it needs no
//! public address. One explicit state machine per tunnel:
//! select → dial → register → serve, with exponential-backoff reconnect.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use quinn::{Connection, Endpoint, IdleTimeout, RecvStream, SendStream, VarInt};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use veilgate_core::tls::{insecure_client_config, pinned_client_config};
use veilgate_crypto::CryptoError;
use veilgate_protocol::{read_message, write_message, Message, EXIT_ALPN};

use crate::handler::OhttpHandler;
use crate::{ExitError, Result};

/// A relay address learned from discovery, with the certificate
/// fingerprint when the discovery layer knows the relay's identity.
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    pub addr: String,
    pub cert_fingerprint: Option<[u8; 32]>,
}

/// Discovery collaborator (the DHT lives outside this crate).
pub trait RelayDiscovery: Send + Sync {
    fn discover_relays(&self) -> BoxFuture<'_, Result<Vec<RelayCandidate>>>;
}

enum RelaySource {
    Static(String),
    Dynamic(Arc<dyn RelayDiscovery>),
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub server_name: String,
    pub keep_alive_interval: Duration,
    pub max_idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_name: "veilgate-relay".to_string(),
            keep_alive_interval: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

pub struct TunnelClient {
    source: RelaySource,
    pub_key_hash: String,
    key_config: Vec<u8>,
    handler: Arc<OhttpHandler>,
    config: TunnelConfig,
    endpoint: Endpoint,
    conn: Mutex<Option<Connection>>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    ready_tx: tokio::sync::watch::Sender<bool>,
    ready_rx: tokio::sync::watch::Receiver<bool>,
}

impl TunnelClient {
    /// Tunnel with a fixed relay address (no identity known, certificate
    /// verification skipped).
    pub fn new_static(
        relay_addr: impl Into<String>,
        pub_key_hash: String,
        key_config: Vec<u8>,
        handler: Arc<OhttpHandler>,
        config: TunnelConfig,
    ) -> Result<Self> {
        Self::new(
            RelaySource::Static(relay_addr.into()),
            pub_key_hash,
            key_config,
            handler,
            config,
        )
    }

    /// Tunnel selecting its relay from a discovery collaborator by probed
    /// handshake RTT.
    pub fn with_discovery(
        discovery: Arc<dyn RelayDiscovery>,
        pub_key_hash: String,
        key_config: Vec<u8>,
        handler: Arc<OhttpHandler>,
        config: TunnelConfig,
    ) -> Result<Self> {
        Self::new(
            RelaySource::Dynamic(discovery),
            pub_key_hash,
            key_config,
            handler,
            config,
        )
    }

    fn new(
        source: RelaySource,
        pub_key_hash: String,
        key_config: Vec<u8>,
        handler: Arc<OhttpHandler>,
        config: TunnelConfig,
    ) -> Result<Self> {
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let endpoint = Endpoint::client(bind)?;
        let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);
        Ok(Self {
            source,
            pub_key_hash,
            key_config,
            handler,
            config,
            endpoint,
            conn: Mutex::new(None),
            run_task: Mutex::new(None),
            cancel: CancellationToken::new(),
            ready_tx,
            ready_rx,
        })
    }

    /// Spawn the tunnel state machine.
    pub fn start(self: Arc<Self>) {
        let tunnel = Arc::clone(&self);
        let task = tokio::spawn(async move { tunnel.run().await });
        *self.run_task.lock().unwrap() = Some(task);
    }

    /// Resolves after the first RegisterAck; embedders sequence client
    /// startup after this.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Cancel the state machine, close the live connection, and join.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.close(VarInt::from_u32(0), b"exit shutting down");
        }
        let task = self.run_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn pub_key_hash(&self) -> &str {
        &self.pub_key_hash
    }

    async fn run(&self) {
        let mut backoff = self.config.initial_backoff;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let candidate = match self.select_relay().await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("relay selection failed: {e}, retrying in {backoff:?}");
                    if !self.sleep_backoff(&mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            let conn = match self.connect_and_register(&candidate).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        "connecting to relay {} failed: {e}, retrying in {backoff:?}",
                        candidate.addr
                    );
                    if !self.sleep_backoff(&mut backoff).await {
                        return;
                    }
                    continue;
                }
            };

            info!(
                "registered with relay {} (pub_key_hash={})",
                candidate.addr, self.pub_key_hash
            );
            backoff = self.config.initial_backoff;
            self.ready_tx.send_replace(true);

            self.serve(conn).await;

            if self.cancel.is_cancelled() {
                return;
            }
            warn!("connection to relay {} lost, reconnecting", candidate.addr);
        }
    }

    /// Sleep the current backoff, doubling it for the next attempt.
    /// Returns false when cancelled.
    async fn sleep_backoff(&self, backoff: &mut Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(*backoff) => {
                *backoff = next_backoff(*backoff, self.config.max_backoff);
                true
            }
        }
    }

    /// SELECT: static address, or the lowest-RTT discovered candidate.
    async fn select_relay(&self) -> Result<RelayCandidate> {
        match &self.source {
            RelaySource::Static(addr) => Ok(RelayCandidate {
                addr: addr.clone(),
                cert_fingerprint: None,
            }),
            RelaySource::Dynamic(discovery) => {
                let candidates = discovery.discover_relays().await?;
                if candidates.is_empty() {
                    return Err(ExitError::NoRelayAvailable);
                }
                info!("discovered {} relay candidates", candidates.len());

                let mut best: Option<(RelayCandidate, Duration)> = None;
                for candidate in candidates {
                    match self.probe(&candidate).await {
                        Ok(rtt) => {
                            debug!("relay {} rtt {rtt:?}", candidate.addr);
                            if best.as_ref().map(|(_, b)| rtt < *b).unwrap_or(true) {
                                best = Some((candidate, rtt));
                            }
                        }
                        Err(e) => warn!("probing relay {} failed: {e}", candidate.addr),
                    }
                }
                best.map(|(candidate, _)| candidate)
                    .ok_or(ExitError::NoRelayAvailable)
            }
        }
    }

    /// Throwaway QUIC handshake to measure RTT.
    async fn probe(&self, candidate: &RelayCandidate) -> Result<Duration> {
        let start = Instant::now();
        let conn = self.dial(candidate).await?;
        let rtt = start.elapsed();
        conn.close(VarInt::from_u32(0), b"probe");
        Ok(rtt)
    }

    /// DIAL: QUIC connection with the exit ALPN. A known relay identity
    /// pins the certificate fingerprint; static mode skips verification.
    async fn dial(&self, candidate: &RelayCandidate) -> Result<Connection> {
        let tls = match candidate.cert_fingerprint {
            Some(fingerprint) => pinned_client_config(EXIT_ALPN, fingerprint),
            None => {
                debug!("no relay identity known, skipping certificate verification");
                insecure_client_config(EXIT_ALPN)
            }
        };
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| ExitError::Transport(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_tls));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.config.keep_alive_interval));
        transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
            self.config.max_idle_timeout.as_millis() as u32,
        ))));
        client_config.transport_config(Arc::new(transport));

        let addr: SocketAddr = candidate
            .addr
            .parse()
            .map_err(|_| ExitError::InvalidRelayAddr(candidate.addr.clone()))?;

        let connecting = self
            .endpoint
            .connect_with(client_config, addr, &self.config.server_name)
            .map_err(|e| ExitError::Transport(e.to_string()))?;
        connecting
            .await
            .map_err(|e| ExitError::Transport(e.to_string()))
    }

    /// REGISTER: one stream carrying Register(pubKeyHash, KeyConfig),
    /// answered by RegisterAck.
    async fn connect_and_register(&self, candidate: &RelayCandidate) -> Result<Connection> {
        let conn = self.dial(candidate).await?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| ExitError::Transport(e.to_string()))?;

        let register = Message::Register {
            target: self.pub_key_hash.clone(),
            key_config: self.key_config.clone(),
        };
        write_message(&mut send, &register).await?;
        let _ = send.finish();

        let reply = read_message(&mut recv).await?;
        if !matches!(reply, Message::RegisterAck) {
            conn.close(VarInt::from_u32(1), b"unexpected register reply");
            return Err(ExitError::RegisterRejected);
        }

        *self.conn.lock().unwrap() = Some(conn.clone());
        Ok(conn)
    }

    /// SERVE: accept inbound streams and run the heartbeat loop, both
    /// owned here and joined before the state machine moves on.
    async fn serve(&self, conn: Connection) {
        let serve_cancel = self.cancel.child_token();
        let heartbeat = tokio::spawn(heartbeat_loop(
            conn.clone(),
            self.config.clone(),
            serve_cancel.clone(),
        ));

        let mut streams = JoinSet::new();
        loop {
            tokio::select! {
                _ = serve_cancel.cancelled() => break,
                res = conn.accept_bi() => match res {
                    Ok((send, recv)) => {
                        let handler = Arc::clone(&self.handler);
                        streams.spawn(handle_incoming_stream(handler, send, recv));
                    }
                    Err(e) => {
                        debug!("accepting stream failed (connection closed?): {e}");
                        break;
                    }
                }
            }
        }

        serve_cancel.cancel();
        let _ = heartbeat.await;
        while streams.join_next().await.is_some() {}
    }
}

/// Heartbeat every interval: open a stream, send Heartbeat, require
/// HeartbeatAck within the deadline. Failures are logged; persistent ones
/// surface as the connection closing, which triggers reconnect.
async fn heartbeat_loop(conn: Connection, config: TunnelConfig, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(config.heartbeat_interval) => {}
        }

        let exchange = async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| ExitError::Transport(e.to_string()))?;
            write_message(&mut send, &Message::Heartbeat).await?;
            let _ = send.finish();
            let reply = read_message(&mut recv).await?;
            if matches!(reply, Message::HeartbeatAck) {
                Ok(())
            } else {
                Err(ExitError::Transport(format!(
                    "expected HeartbeatAck, got type 0x{:02x}",
                    reply.type_byte()
                )))
            }
        };

        match timeout(config.heartbeat_timeout, exchange).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("heartbeat failed: {e}"),
            Err(_) => warn!("heartbeat timed out"),
        }
    }
}

/// One relay-forwarded stream: a single message, dispatched by type.
/// Error frames stay generic; internals never leave the exit.
async fn handle_incoming_stream(
    handler: Arc<OhttpHandler>,
    mut send: SendStream,
    mut recv: RecvStream,
) {
    let msg = match read_message(&mut recv).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!("decoding inbound message failed: {e}");
            write_error(&mut send, "decode error").await;
            return;
        }
    };

    match msg {
        Message::Request { payload, .. } => match handler.process_request(&payload).await {
            Ok(resp) => {
                if write_message(&mut send, &Message::Response { payload: resp })
                    .await
                    .is_err()
                {
                    debug!("writing response back failed");
                }
            }
            Err(e) => {
                warn!("request processing failed: {e}");
                // Key mismatches get their own generic string so clients
                // can tell stale keys from transient failures.
                let reason = match &e {
                    ExitError::Crypto(CryptoError::KeyIdMismatch { .. }) => "keyID mismatch",
                    _ => "request processing failed",
                };
                write_error(&mut send, reason).await;
            }
        },
        Message::StreamRequest { payload, .. } => {
            if let Err(e) = handler.process_stream_request(&payload, &mut send).await {
                warn!("stream processing failed: {e}");
                // The stream may be partially written; the error frame is
                // best effort.
                write_error(&mut send, "stream processing failed").await;
            }
        }
        Message::Heartbeat => {
            let _ = write_message(&mut send, &Message::HeartbeatAck).await;
        }
        other => {
            warn!("unexpected message type 0x{:02x}", other.type_byte());
            write_error(&mut send, "unexpected message type").await;
        }
    }
    let _ = send.finish();
}

async fn write_error(send: &mut SendStream, message: &str) {
    let _ = write_message(
        send,
        &Message::Error {
            message: message.to_string(),
        },
    )
    .await;
}
