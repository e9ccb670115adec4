//! Client core
//!
//! Holds at most one QUIC connection to the relay, validated on use and
//! re-dialed under the connection lock. Every request runs on its own
//! stream: encapsulate, send, read one response (or pull encrypted
//! chunks for streaming).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::Duration;

use quinn::{Connection, Endpoint, IdleTimeout, RecvStream, SendStream, VarInt};
use tracing::{debug, info, warn};

use veilgate_core::tls::{insecure_client_config, pinned_client_config};
use veilgate_core::{HttpRequest, HttpResponse};
use veilgate_crypto::{decode_key_config, pub_key_hash, OhttpClient, StreamDecryptor};
use veilgate_protocol::{
    decode_exit_keys, read_message, write_message, ExitKeyEntry, Message, RELAY_ALPN,
};

use crate::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_name: String,
    pub keep_alive_interval: Duration,
    pub max_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_name: "veilgate-relay".to_string(),
            keep_alive_interval: Duration::from_secs(30),
            max_idle_timeout: Duration::from_secs(120),
        }
    }
}

struct ExitTarget {
    ohttp: OhttpClient,
    pub_key_hash: String,
}

pub struct Client {
    endpoint: Endpoint,
    config: ClientConfig,
    relay_addr: Mutex<Option<String>>,
    relay_fingerprint: Mutex<Option<[u8; 32]>>,
    exit: Mutex<Option<ExitTarget>>,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl Client {
    /// Client with a fixed relay and exit key (static mode; certificate
    /// verification skipped).
    pub fn new(relay_addr: impl Into<String>, key_id: u8, exit_public_key: &[u8]) -> Result<Self> {
        let client = Self::new_dynamic()?;
        client.set_relay(relay_addr);
        client.set_exit(key_id, exit_public_key)?;
        Ok(client)
    }

    /// Client without a preset relay or exit; both are supplied later
    /// through `set_relay` / `set_exit` (e.g. after discovery).
    pub fn new_dynamic() -> Result<Self> {
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let endpoint = Endpoint::client(bind)?;
        Ok(Self {
            endpoint,
            config: ClientConfig::default(),
            relay_addr: Mutex::new(None),
            relay_fingerprint: Mutex::new(None),
            exit: Mutex::new(None),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    pub fn set_relay(&self, addr: impl Into<String>) {
        *self.relay_addr.lock().unwrap() = Some(addr.into());
    }

    /// Pin the relay's certificate fingerprint (identity known from
    /// discovery). Without it, verification is skipped.
    pub fn set_relay_fingerprint(&self, fingerprint: [u8; 32]) {
        *self.relay_fingerprint.lock().unwrap() = Some(fingerprint);
    }

    /// Choose the exit: its KeyID + public key become the encapsulation
    /// target, its pubKeyHash the routing key in every request.
    pub fn set_exit(&self, key_id: u8, public_key: &[u8]) -> Result<()> {
        let ohttp = OhttpClient::new(key_id, public_key)?;
        *self.exit.lock().unwrap() = Some(ExitTarget {
            ohttp,
            pub_key_hash: pub_key_hash(public_key),
        });
        Ok(())
    }

    /// Convenience: pick an exit from an ExitKeysResponse entry.
    pub fn set_exit_from_entry(&self, entry: &ExitKeyEntry) -> Result<()> {
        let (key_id, public_key) = decode_key_config(&entry.key_config)?;
        self.set_exit(key_id, &public_key)
    }

    pub fn exit_pub_key_hash(&self) -> Option<String> {
        self.exit
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.pub_key_hash.clone())
    }

    pub fn relay_addr(&self) -> Option<String> {
        self.relay_addr.lock().unwrap().clone()
    }

    /// Dial the relay now, replacing any existing connection.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.reconnect_locked(&mut guard).await?;
        Ok(())
    }

    /// Close the current connection.
    pub async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close(VarInt::from_u32(0), b"client closed");
        }
    }

    async fn reconnect_locked(&self, guard: &mut Option<Connection>) -> Result<Connection> {
        if let Some(old) = guard.take() {
            old.close(VarInt::from_u32(0), b"reconnecting");
        }

        let addr = self.relay_addr().ok_or(ClientError::NoRelayAddress)?;
        let fingerprint = *self.relay_fingerprint.lock().unwrap();

        let tls = match fingerprint {
            Some(fp) => pinned_client_config(RELAY_ALPN, fp),
            None => {
                debug!("no relay identity known, skipping certificate verification");
                insecure_client_config(RELAY_ALPN)
            }
        };
        let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(std::sync::Arc::new(quic_tls));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.config.keep_alive_interval));
        transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
            self.config.max_idle_timeout.as_millis() as u32,
        ))));
        client_config.transport_config(std::sync::Arc::new(transport));

        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|_| ClientError::InvalidRelayAddr(addr.clone()))?;
        let conn = self
            .endpoint
            .connect_with(client_config, socket_addr, &self.config.server_name)
            .map_err(|e| ClientError::Transport(e.to_string()))?
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        info!("connected to relay {addr}");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Current connection if still alive, otherwise a fresh dial. All
    /// connect/reconnect happens under the connection lock.
    async fn get_connection(&self) -> Result<Connection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            debug!("relay connection closed, reconnecting");
        }
        self.reconnect_locked(&mut guard).await
    }

    fn encapsulate(
        &self,
        req: &HttpRequest,
    ) -> Result<(Vec<u8>, veilgate_crypto::ClientContext, String)> {
        let guard = self.exit.lock().unwrap();
        let target = guard.as_ref().ok_or(ClientError::NoExitConfigured)?;
        let (sealed, ctx) = target.ohttp.encapsulate_request(req)?;
        Ok((sealed, ctx, target.pub_key_hash.clone()))
    }

    async fn open_stream(&self) -> Result<(SendStream, RecvStream)> {
        let conn = self.get_connection().await?;
        conn.open_bi()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Unary request: Request frame, half-close, one Response back.
    pub async fn send_request(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let (payload, ctx, target) = self.encapsulate(req)?;
        let (mut send, mut recv) = self.open_stream().await?;

        write_message(&mut send, &Message::Request { target, payload }).await?;
        send.finish()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        match read_message(&mut recv).await? {
            Message::Response { payload } => Ok(ctx.decapsulate_response(&payload)?),
            Message::Error { message } => Err(ClientError::Remote(message)),
            other => Err(ClientError::UnexpectedMessage(other.type_byte())),
        }
    }

    /// Streaming request: StreamRequest frame, then a handle that owns
    /// the stream and decrypts chunks as they arrive. The write side is
    /// kept open for the lifetime of the exchange.
    pub async fn send_stream_request(&self, req: &HttpRequest) -> Result<StreamResponse> {
        let (payload, ctx, target) = self.encapsulate(req)?;
        let (mut send, recv) = self.open_stream().await?;

        write_message(&mut send, &Message::StreamRequest { target, payload }).await?;
        let decryptor = ctx.into_stream_decryptor()?;

        Ok(StreamResponse {
            _send: send,
            recv,
            decryptor,
        })
    }

    /// Ask the relay for its live exits and their key advertisements.
    pub async fn query_exit_keys(&self) -> Result<Vec<ExitKeyEntry>> {
        let (mut send, mut recv) = self.open_stream().await?;

        write_message(&mut send, &Message::QueryExitKeys).await?;
        send.finish()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        match read_message(&mut recv).await? {
            Message::ExitKeysResponse { payload } => Ok(decode_exit_keys(&payload)?),
            Message::Error { message } => Err(ClientError::Remote(message)),
            other => Err(ClientError::UnexpectedMessage(other.type_byte())),
        }
    }
}

/// Streaming response handle owning the stream and its decryptor.
pub struct StreamResponse {
    _send: SendStream,
    recv: RecvStream,
    decryptor: StreamDecryptor,
}

impl StreamResponse {
    /// Next decrypted SSE event. `Ok(None)` marks the end of the stream;
    /// a relayed Error frame or a corrupt chunk surfaces as `Err`.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match read_message(&mut self.recv).await? {
            Message::StreamChunk { payload } => {
                let plain = self.decryptor.decrypt_chunk(&payload)?;
                Ok(Some(plain))
            }
            Message::StreamEnd => Ok(None),
            Message::Error { message } => Err(ClientError::Remote(message)),
            other => Err(ClientError::UnexpectedMessage(other.type_byte())),
        }
    }

    /// Cancel the underlying read.
    pub fn close(&mut self) {
        if let Err(e) = self.recv.stop(VarInt::from_u32(0)) {
            warn!("stopping stream failed: {e}");
        }
    }
}
