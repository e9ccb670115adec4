//! End-to-end gateway tests
//!
//! Full chain on loopback: an axum mock AI backend, a relay on port 0, an
//! exit tunnel in static mode, and a client. Covers the unary and
//! streaming round trips, exit-key discovery, routing failures,
//! registration replacement, heartbeat eviction, and relay-restart
//! reconnection.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use axum::routing::{any, post};
use axum::Router;

use veilgate::client::Client;
use veilgate::core::tls::insecure_client_config;
use veilgate::core::HttpRequest;
use veilgate::crypto::KeyPair;
use veilgate::exit::{ExitConfig, ExitNode, TunnelConfig};
use veilgate::protocol::{read_message, write_message, Message, EXIT_ALPN, RELAY_ALPN};
use veilgate::relay::{RelayConfig, RelayNode};

const ECHO_BODY: &str = r#"{"choices":[{"message":{"content":"hi"}}]}"#;

async fn spawn_backend(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn spawn_json_backend() -> SocketAddr {
    spawn_backend(Router::new().route(
        "/{*path}",
        any(|| async {
            ([("content-type", "application/json")], ECHO_BODY)
        }),
    ))
    .await
}

async fn spawn_sse_backend() -> SocketAddr {
    spawn_backend(Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let events = futures::stream::iter(vec![
                Ok::<_, Infallible>(Event::default().data(r#"{"delta":"A"}"#)),
                Ok(Event::default().data(r#"{"delta":"B"}"#)),
                Ok(Event::default().data("[DONE]")),
            ]);
            Sse::new(events)
        }),
    ))
    .await
}

struct Gateway {
    relay: RelayNode,
    exit: ExitNode,
    keys: KeyPair,
    relay_addr: SocketAddr,
}

async fn start_relay(config: RelayConfig) -> RelayNode {
    let relay = RelayNode::new(config);
    relay.start().await.expect("relay start");
    relay.ready().await;
    relay
}

fn loopback_relay_config() -> RelayConfig {
    RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

/// The relay acks registrations before inserting them, so observers poll
/// for the registry to catch up.
async fn wait_for_registrations(relay: &RelayNode, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.registry().count() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {expected} entries"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_gateway(backend: SocketAddr) -> Gateway {
    start_gateway_with(backend, loopback_relay_config(), TunnelConfig::default()).await
}

async fn start_gateway_with(
    backend: SocketAddr,
    relay_config: RelayConfig,
    tunnel_config: TunnelConfig,
) -> Gateway {
    let relay = start_relay(relay_config).await;
    let relay_addr = relay.local_addr().expect("relay bound");

    let keys = KeyPair::generate();
    let exit = ExitNode::new(
        ExitConfig {
            relay_addr: relay_addr.to_string(),
            backend_url: format!("http://{backend}"),
            api_key: None,
            headers: HashMap::new(),
            tunnel: tunnel_config,
        },
        &keys,
    )
    .expect("exit node");
    exit.start();
    tokio::time::timeout(Duration::from_secs(5), exit.ready())
        .await
        .expect("exit registration timed out");
    wait_for_registrations(&relay, 1).await;

    Gateway {
        relay,
        exit,
        keys,
        relay_addr,
    }
}

impl Gateway {
    async fn connect_client(&self) -> Client {
        let client = Client::new(
            self.relay_addr.to_string(),
            self.keys.key_id(),
            self.keys.public_key(),
        )
        .unwrap();
        client.connect().await.expect("client connect");
        client
    }

    async fn teardown(self) {
        self.exit.stop().await;
        self.relay.stop().await;
    }
}

fn chat_request(body: &str) -> HttpRequest {
    HttpRequest::new("POST", "/v1/chat/completions")
        .header("Content-Type", "application/json")
        .body(body.as_bytes().to_vec())
}

#[tokio::test]
async fn test_unary_roundtrip() {
    let backend = spawn_json_backend().await;
    let gateway = start_gateway(backend).await;
    let client = gateway.connect_client().await;

    let req = chat_request(r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#);
    let resp = client.send_request(&req).await.expect("send request");

    assert_eq!(resp.status, 200);
    assert_eq!(String::from_utf8_lossy(&resp.body), ECHO_BODY);

    client.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_streaming_roundtrip() {
    let backend = spawn_sse_backend().await;
    let gateway = start_gateway(backend).await;
    let client = gateway.connect_client().await;

    let req = chat_request(r#"{"model":"x","stream":true,"messages":[]}"#);
    let mut stream = client
        .send_stream_request(&req)
        .await
        .expect("stream request");

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.read_chunk().await.expect("read chunk") {
        chunks.push(String::from_utf8_lossy(&chunk).into_owned());
    }

    assert_eq!(chunks.len(), 3);
    let combined = chunks.concat();
    assert!(combined.contains("A"), "missing first delta: {combined}");
    assert!(combined.contains("B"), "missing second delta: {combined}");
    assert!(combined.contains("[DONE]"), "missing terminator: {combined}");

    client.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_multiple_sequential_requests_reuse_connection() {
    let backend = spawn_json_backend().await;
    let gateway = start_gateway(backend).await;
    let client = gateway.connect_client().await;

    for i in 0..5 {
        let req = chat_request(&format!(r#"{{"model":"x","n":{i}}}"#));
        let resp = client.send_request(&req).await.expect("send request");
        assert_eq!(resp.status, 200, "request {i} failed");
    }

    client.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_unknown_exit_returns_error() {
    let backend = spawn_json_backend().await;
    let gateway = start_gateway(backend).await;

    // A key nobody registered: its hash misses the registry.
    let stranger = KeyPair::generate();
    let client = Client::new(
        gateway.relay_addr.to_string(),
        stranger.key_id(),
        stranger.public_key(),
    )
    .unwrap();
    client.connect().await.unwrap();

    let err = client
        .send_request(&chat_request("{}"))
        .await
        .expect_err("routing should fail");
    assert!(
        err.to_string().contains("exit not found"),
        "unexpected error: {err}"
    );

    client.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_key_id_mismatch_fails_only_that_request() {
    let backend = spawn_json_backend().await;
    let gateway = start_gateway(backend).await;

    // Right public key (so routing succeeds), wrong KeyID.
    let wrong = Client::new(
        gateway.relay_addr.to_string(),
        gateway.keys.key_id().wrapping_add(1),
        gateway.keys.public_key(),
    )
    .unwrap();
    wrong.connect().await.unwrap();

    let err = wrong
        .send_request(&chat_request("{}"))
        .await
        .expect_err("mismatched KeyID must fail");
    assert!(
        err.to_string().contains("keyID mismatch"),
        "unexpected error: {err}"
    );

    // The exit stays registered and serves correctly-keyed requests.
    let good = gateway.connect_client().await;
    let resp = good.send_request(&chat_request("{}")).await.unwrap();
    assert_eq!(resp.status, 200);

    wrong.close().await;
    good.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_query_exit_keys() {
    let backend = spawn_json_backend().await;
    let gateway = start_gateway(backend).await;
    let client = gateway.connect_client().await;

    let entries = client.query_exit_keys().await.expect("query exit keys");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pub_key_hash, gateway.keys.pub_key_hash());

    let (key_id, public) = veilgate::crypto::decode_key_config(&entries[0].key_config).unwrap();
    assert_eq!(key_id, gateway.keys.key_id());
    assert_eq!(public, gateway.keys.public_key());

    // A dynamic client can bootstrap purely from the response.
    let dynamic = Client::new_dynamic().unwrap();
    dynamic.set_relay(gateway.relay_addr.to_string());
    dynamic.set_exit_from_entry(&entries[0]).unwrap();
    let resp = dynamic.send_request(&chat_request("{}")).await.unwrap();
    assert_eq!(resp.status, 200);

    client.close().await;
    dynamic.close().await;
    gateway.teardown().await;
}

#[tokio::test]
async fn test_backend_error_status_passes_through() {
    let backend = spawn_backend(Router::new().route(
        "/{*path}",
        any(|| async {
            (
                axum::http::StatusCode::BAD_GATEWAY,
                [("content-type", "application/json")],
                r#"{"error":"upstream exploded"}"#,
            )
        }),
    ))
    .await;
    let gateway = start_gateway(backend).await;
    let client = gateway.connect_client().await;

    let resp = client.send_request(&chat_request("{}")).await.unwrap();
    assert_eq!(resp.status, 502);
    assert!(String::from_utf8_lossy(&resp.body).contains("upstream exploded"));

    client.close().await;
    gateway.teardown().await;
}

/// Minimal hand-rolled exit: dial with the exit ALPN, register a hash,
/// and keep the connection for the test to drive.
async fn fake_exit(relay_addr: SocketAddr, hash: &str) -> quinn::Connection {
    let endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).unwrap();
    let tls = insecure_client_config(EXIT_ALPN);
    let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap();
    let config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let conn = endpoint
        .connect_with(config, relay_addr, "veilgate-relay")
        .unwrap()
        .await
        .unwrap();

    let (mut send, mut recv) = conn.open_bi().await.unwrap();
    write_message(
        &mut send,
        &Message::Register {
            target: hash.to_string(),
            key_config: vec![1, 2, 3],
        },
    )
    .await
    .unwrap();
    send.finish().unwrap();

    let reply = read_message(&mut recv).await.unwrap();
    assert!(matches!(reply, Message::RegisterAck), "got {reply:?}");

    // Leak the endpoint so the connection outlives this function.
    std::mem::forget(endpoint);
    conn
}

/// Raw client connection for driving the relay without the crypto layer.
async fn raw_client(relay_addr: SocketAddr) -> quinn::Connection {
    let endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().unwrap()).unwrap();
    let tls = insecure_client_config(RELAY_ALPN);
    let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap();
    let config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let conn = endpoint
        .connect_with(config, relay_addr, "veilgate-relay")
        .unwrap()
        .await
        .unwrap();
    std::mem::forget(endpoint);
    conn
}

#[tokio::test]
async fn test_exit_replacement_closes_old_connection() {
    let relay = start_relay(loopback_relay_config()).await;
    let relay_addr = relay.local_addr().unwrap();

    let first = fake_exit(relay_addr, "deadbeef").await;
    wait_for_registrations(&relay, 1).await;
    let second = fake_exit(relay_addr, "deadbeef").await;

    // The displaced connection is closed by the relay with the
    // replacement reason.
    let reason = first.closed().await;
    match reason {
        quinn::ConnectionError::ApplicationClosed(frame) => {
            assert_eq!(frame.reason.as_ref(), &b"replaced by new connection"[..]);
        }
        other => panic!("expected application close, got {other:?}"),
    }

    assert_eq!(relay.registry().count(), 1);
    let keys = relay.registry().list_exit_keys();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].pub_key_hash, "deadbeef");

    // Requests for the hash reach the surviving registration.
    let client_conn = raw_client(relay_addr).await;
    let (mut send, mut recv) = client_conn.open_bi().await.unwrap();
    write_message(
        &mut send,
        &Message::Request {
            target: "deadbeef".to_string(),
            payload: vec![0xAB],
        },
    )
    .await
    .unwrap();
    send.finish().unwrap();

    let (mut exit_send, mut exit_recv) = second.accept_bi().await.unwrap();
    let forwarded = read_message(&mut exit_recv).await.unwrap();
    match forwarded {
        Message::Request { target, payload } => {
            assert!(target.is_empty(), "relay must strip the routing key");
            assert_eq!(payload, vec![0xAB]);
        }
        other => panic!("unexpected forward: {other:?}"),
    }
    write_message(&mut exit_send, &Message::Response { payload: vec![0xCD] })
        .await
        .unwrap();
    exit_send.finish().unwrap();

    let resp = read_message(&mut recv).await.unwrap();
    assert_eq!(resp, Message::Response { payload: vec![0xCD] });

    relay.stop().await;
}

#[tokio::test]
async fn test_silent_exit_is_evicted_by_heartbeat_ttl() {
    let relay = start_relay(RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        heartbeat_ttl: Duration::from_millis(400),
        ..Default::default()
    })
    .await;
    let relay_addr = relay.local_addr().unwrap();

    let silent = fake_exit(relay_addr, "cafebabe").await;
    wait_for_registrations(&relay, 1).await;

    let reason = tokio::time::timeout(Duration::from_secs(5), silent.closed())
        .await
        .expect("eviction timed out");
    match reason {
        quinn::ConnectionError::ApplicationClosed(frame) => {
            assert_eq!(frame.reason.as_ref(), &b"heartbeat timeout"[..]);
        }
        other => panic!("expected application close, got {other:?}"),
    }
    assert_eq!(relay.registry().count(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_exit_reconnects_after_relay_restart() {
    let backend = spawn_json_backend().await;
    let tunnel = TunnelConfig {
        initial_backoff: Duration::from_millis(200),
        max_backoff: Duration::from_secs(2),
        ..Default::default()
    };
    let gateway = start_gateway_with(backend, loopback_relay_config(), tunnel).await;
    let relay_addr = gateway.relay_addr;
    let client = gateway.connect_client().await;

    // Kill the relay mid-session; the next request fails with a
    // transport-level error.
    gateway.relay.stop().await;
    assert!(client.send_request(&chat_request("{}")).await.is_err());

    // Restart on the same address; the tunnel re-registers within a
    // bounded number of backoff iterations.
    let relay2 = start_relay(RelayConfig {
        listen: relay_addr,
        ..Default::default()
    })
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while relay2.registry().count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "exit did not re-register in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The client reconnects on its next request and the chain works.
    let resp = client
        .send_request(&chat_request("{}"))
        .await
        .expect("request after reconnect");
    assert_eq!(resp.status, 200);

    client.close().await;
    gateway.exit.stop().await;
    relay2.stop().await;
}
