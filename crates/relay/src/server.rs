//! Relay QUIC server
//!
//! Accepts inbound connections and demultiplexes by negotiated ALPN: exit
//! reverse tunnels register and then serve heartbeats; everything else is
//! treated as a client whose streams carry one request each. Forwarded
//! payloads are never parsed.

use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint, IdleTimeout, RecvStream, SendStream, VarInt};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use veilgate_protocol::{
    encode_exit_keys, read_message, write_message, Message, EXIT_ALPN,
};

use crate::registry::Registry;
use crate::RelayConfig;

const CLOSE_OK: u32 = 0;
const CLOSE_PROTOCOL_ERROR: u32 = 1;

pub(crate) fn transport_config(config: &RelayConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(config.keep_alive_interval));
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
        config.max_idle_timeout.as_millis() as u32,
    ))));
    transport
}

/// Accept loop. Owns every per-connection task and joins them before
/// returning, so `RelayNode::stop` completes only after all handlers
/// have drained.
pub(crate) async fn accept_loop(
    endpoint: Endpoint,
    registry: Arc<Registry<Connection>>,
    config: RelayConfig,
    cancel: CancellationToken,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let registry = Arc::clone(&registry);
                let config = config.clone();
                let cancel = cancel.child_token();
                handlers.spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_connection(conn, registry, config, cancel).await,
                        Err(e) => debug!("inbound connection failed: {e}"),
                    }
                });
            }
        }
    }
    while handlers.join_next().await.is_some() {}
}

/// Periodic registry cleaner, running at TTL/2.
pub(crate) async fn cleanup_loop(
    registry: Arc<Registry<Connection>>,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let interval = ttl / 2;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => registry.cleanup(ttl),
        }
    }
}

async fn handle_connection(
    conn: Connection,
    registry: Arc<Registry<Connection>>,
    config: RelayConfig,
    cancel: CancellationToken,
) {
    let alpn = conn
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.protocol)
        .unwrap_or_default();
    debug!(
        "new connection from {} (alpn {:?})",
        conn.remote_address(),
        String::from_utf8_lossy(&alpn)
    );

    if alpn == EXIT_ALPN {
        handle_exit_connection(conn, registry, cancel).await;
    } else {
        handle_client_connection(conn, registry, config, cancel).await;
    }
}

/// Exit reverse tunnel: one registration stream, then heartbeats. Forward
/// streams toward this exit are opened by the relay, not accepted here.
async fn handle_exit_connection(
    conn: Connection,
    registry: Arc<Registry<Connection>>,
    cancel: CancellationToken,
) {
    let remote = conn.remote_address();

    let (mut reg_send, mut reg_recv) = tokio::select! {
        _ = cancel.cancelled() => return,
        res = conn.accept_bi() => match res {
            Ok(streams) => streams,
            Err(e) => {
                debug!("exit {remote}: accepting registration stream failed: {e}");
                conn.close(VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"accept register stream failed");
                return;
            }
        }
    };

    let msg = match read_message(&mut reg_recv).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!("exit {remote}: reading registration failed: {e}");
            conn.close(VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"read register message failed");
            return;
        }
    };

    let (pub_key_hash, key_config) = match msg {
        Message::Register { target, key_config } if !target.is_empty() => (target, key_config),
        Message::Register { .. } => {
            warn!("exit {remote}: registration missing pubKeyHash");
            write_error(&mut reg_send, "missing pubKeyHash").await;
            conn.close(VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"missing pubKeyHash");
            return;
        }
        other => {
            warn!(
                "exit {remote}: expected Register, got type 0x{:02x}",
                other.type_byte()
            );
            write_error(&mut reg_send, "expected register message").await;
            conn.close(VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"unexpected message type");
            return;
        }
    };

    // Ack before inserting: a client may pick this exit from an
    // ExitKeysResponse the instant the registry admits it, and must not
    // be routed to an exit that has not seen its ack yet.
    if write_message(&mut reg_send, &Message::RegisterAck).await.is_err() {
        warn!("exit {pub_key_hash}: sending RegisterAck failed");
        conn.close(VarInt::from_u32(CLOSE_PROTOCOL_ERROR), b"send register ack failed");
        return;
    }
    let _ = reg_send.finish();

    registry.register(&pub_key_hash, conn.clone(), key_config);
    info!("exit {pub_key_hash}: registered from {remote}");

    loop {
        let (mut hb_send, mut hb_recv) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = conn.accept_bi() => match res {
                Ok(streams) => streams,
                Err(e) => {
                    debug!("exit {pub_key_hash}: connection ended: {e}");
                    break;
                }
            }
        };

        match read_message(&mut hb_recv).await {
            Ok(Message::Heartbeat) => {
                registry.update_heartbeat(&pub_key_hash);
                let _ = write_message(&mut hb_send, &Message::HeartbeatAck).await;
            }
            Ok(other) => warn!(
                "exit {pub_key_hash}: unexpected type 0x{:02x} on heartbeat stream",
                other.type_byte()
            ),
            Err(e) => debug!("exit {pub_key_hash}: reading heartbeat failed: {e}"),
        }
        let _ = hb_send.finish();
    }

    // A displaced registration must not evict its successor.
    registry.remove_if_match(&pub_key_hash, &conn);
    conn.close(VarInt::from_u32(CLOSE_OK), b"exit connection closed");
    info!("exit {pub_key_hash}: connection closed");
}

/// Client connection: every stream carries one exchange and gets an
/// independent handler; all handlers are joined before the connection
/// handler returns.
async fn handle_client_connection(
    conn: Connection,
    registry: Arc<Registry<Connection>>,
    config: RelayConfig,
    cancel: CancellationToken,
) {
    let mut streams = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = conn.accept_bi() => match res {
                Ok((send, recv)) => {
                    let registry = Arc::clone(&registry);
                    let forward_timeout = config.forward_timeout;
                    streams.spawn(handle_client_stream(send, recv, registry, forward_timeout));
                }
                Err(e) => {
                    debug!("client connection ended: {e}");
                    break;
                }
            }
        }
    }
    while streams.join_next().await.is_some() {}
    conn.close(VarInt::from_u32(CLOSE_OK), b"connection closed");
}

async fn handle_client_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    registry: Arc<Registry<Connection>>,
    forward_timeout: Duration,
) {
    let msg = match read_message(&mut recv).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!("reading client message failed: {e}");
            return;
        }
    };

    match msg {
        Message::Request { target, payload } => {
            forward_request(&mut send, target, payload, &registry, forward_timeout).await;
        }
        Message::StreamRequest { target, payload } => {
            forward_stream_request(&mut send, target, payload, &registry, forward_timeout).await;
        }
        Message::QueryExitKeys => {
            let entries = registry.list_exit_keys();
            match encode_exit_keys(&entries) {
                Ok(payload) => {
                    let _ = write_message(&mut send, &Message::ExitKeysResponse { payload }).await;
                }
                Err(e) => {
                    warn!("serializing exit keys failed: {e}");
                    write_error(&mut send, "failed to serialize exit keys").await;
                }
            }
        }
        other => {
            warn!("invalid message type 0x{:02x}", other.type_byte());
            write_error(&mut send, "invalid message type").await;
        }
    }
    let _ = send.finish();
}

/// Open a forward stream to the exit registered for `target`, evicting the
/// stale entry (identity-checked) when the open fails.
async fn open_exit_stream(
    send: &mut SendStream,
    target: &str,
    registry: &Registry<Connection>,
    forward_timeout: Duration,
) -> Option<(SendStream, RecvStream)> {
    if target.is_empty() {
        write_error(send, "missing target address").await;
        return None;
    }

    let Some(exit_conn) = registry.lookup(target) else {
        debug!("exit {target} not registered");
        write_error(send, "exit not found").await;
        return None;
    };

    match timeout(forward_timeout, exit_conn.open_bi()).await {
        Ok(Ok(streams)) => Some(streams),
        Ok(Err(e)) => {
            warn!("opening stream to exit {target} failed: {e}");
            registry.remove_if_match(target, &exit_conn);
            write_error(send, "exit connection failed").await;
            None
        }
        Err(_) => {
            warn!("opening stream to exit {target} timed out");
            registry.remove_if_match(target, &exit_conn);
            write_error(send, "exit connection failed").await;
            None
        }
    }
}

async fn forward_request(
    send: &mut SendStream,
    target: String,
    payload: Vec<u8>,
    registry: &Registry<Connection>,
    forward_timeout: Duration,
) {
    let Some((mut exit_send, mut exit_recv)) =
        open_exit_stream(send, &target, registry, forward_timeout).await
    else {
        return;
    };

    // Target is dropped on the relay→exit hop; the payload is forwarded
    // untouched.
    let forwarded = Message::Request {
        target: String::new(),
        payload,
    };
    if write_message(&mut exit_send, &forwarded).await.is_err() {
        warn!("writing request to exit {target} failed");
        write_error(send, "write to exit failed").await;
        return;
    }
    let _ = exit_send.finish();

    match read_message(&mut exit_recv).await {
        Ok(resp) => {
            if write_message(send, &resp).await.is_err() {
                debug!("writing response back to client failed");
            }
        }
        Err(e) => {
            warn!("reading response from exit {target} failed: {e}");
            write_error(send, "read exit response failed").await;
        }
    }
}

async fn forward_stream_request(
    send: &mut SendStream,
    target: String,
    payload: Vec<u8>,
    registry: &Registry<Connection>,
    forward_timeout: Duration,
) {
    let Some((mut exit_send, mut exit_recv)) =
        open_exit_stream(send, &target, registry, forward_timeout).await
    else {
        return;
    };

    let forwarded = Message::StreamRequest {
        target: String::new(),
        payload,
    };
    if write_message(&mut exit_send, &forwarded).await.is_err() {
        warn!("writing stream request to exit {target} failed");
        write_error(send, "write to exit failed").await;
        return;
    }
    let _ = exit_send.finish();

    // Pump messages verbatim until the exit terminates the stream.
    loop {
        let msg = match read_message(&mut exit_recv).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!("reading stream response from exit {target} failed: {e}");
                return;
            }
        };

        let done = matches!(msg, Message::StreamEnd | Message::Error { .. });
        if write_message(send, &msg).await.is_err() {
            debug!("writing stream response to client failed");
            return;
        }
        if done {
            return;
        }
    }
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
