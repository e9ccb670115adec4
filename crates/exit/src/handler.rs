//! OHTTP-to-backend handler
//!
//! Owns the exit's OHTTP private key and the backend client. Unary
//! requests are decrypted, forwarded, and the backend's answer (any
//! status) is re-encrypted. Streaming requests derive a chunk encryptor
//! from the same context and emit one encrypted StreamChunk per SSE
//! event, terminated by StreamEnd.

use futures::StreamExt;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use veilgate_core::HttpResponse;
use veilgate_crypto::{encode_key_config, OhttpServer};
use veilgate_protocol::{write_message, Message};

use crate::backend::AiClient;
use crate::{ExitError, Result};

pub struct OhttpHandler {
    server: OhttpServer,
    backend: AiClient,
    key_config: Vec<u8>,
}

impl OhttpHandler {
    pub fn new(
        key_id: u8,
        private_key: &[u8],
        public_key: &[u8],
        backend: AiClient,
    ) -> Result<Self> {
        let server = OhttpServer::new(key_id, private_key)?;
        let key_config = encode_key_config(key_id, public_key);
        Ok(Self {
            server,
            backend,
            key_config,
        })
    }

    /// The advertisement registered with relays.
    pub fn key_config(&self) -> &[u8] {
        &self.key_config
    }

    /// Decrypt → forward → re-encrypt. An unreachable backend becomes an
    /// encapsulated 502, not a local failure.
    pub async fn process_request(&self, ohttp_req: &[u8]) -> Result<Vec<u8>> {
        let (inner, ctx) = self.server.decapsulate_request(ohttp_req)?;
        debug!("handling {} {}", inner.method, inner.path);

        let resp = match self.backend.forward(&inner).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("backend request failed: {e}");
                bad_gateway_response()
            }
        };

        Ok(ctx.encapsulate_response(&resp)?)
    }

    /// Streaming variant: reads the backend body line by line, flushing
    /// one encrypted chunk per blank-line-terminated SSE event onto the
    /// caller's writer, then StreamEnd.
    pub async fn process_stream_request<W: AsyncWrite + Unpin>(
        &self,
        ohttp_req: &[u8],
        writer: &mut W,
    ) -> Result<()> {
        let (inner, ctx) = self.server.decapsulate_request(ohttp_req)?;
        debug!("handling streaming {} {}", inner.method, inner.path);
        let encryptor = ctx.into_stream_encryptor()?;

        let resp = self.backend.forward_stream(&inner).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExitError::BackendStatus {
                status: status.as_u16(),
            });
        }

        let mut body = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut event: Vec<u8> = Vec::new();

        while let Some(next) = body.next().await {
            let chunk = next?;
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                let blank = line.is_empty();
                event.extend_from_slice(&line);
                event.push(b'\n');

                // SSE events end at a blank line; the event bytes keep
                // their line framing, blank separator included.
                if blank && event.len() > 1 {
                    let sealed = encryptor.encrypt_chunk(&event)?;
                    write_message(writer, &Message::StreamChunk { payload: sealed }).await?;
                    event.clear();
                }
            }
        }

        write_message(writer, &Message::StreamEnd).await?;
        Ok(())
    }
}

fn bad_gateway_response() -> HttpResponse {
    HttpResponse::new(
        502,
        vec![("Content-Type".to_string(), "application/json".to_string())],
        br#"{"error":"AI backend unavailable"}"#.to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::sse::{Event, Sse};
    use axum::routing::{any, post};
    use axum::Router;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use veilgate_core::HttpRequest;
    use veilgate_crypto::{KeyPair, OhttpClient};
    use veilgate_protocol::read_message;

    async fn spawn_json_backend(status: u16) -> SocketAddr {
        let app = Router::new().route(
            "/{*path}",
            any(move || async move {
                (
                    axum::http::StatusCode::from_u16(status).unwrap(),
                    [("content-type", "application/json")],
                    r#"{"choices":[{"message":{"content":"hi"}}]}"#,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn spawn_sse_backend() -> SocketAddr {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let events = futures::stream::iter(vec![
                    Ok::<_, Infallible>(Event::default().data(r#"{"delta":"A"}"#)),
                    Ok(Event::default().data(r#"{"delta":"B"}"#)),
                    Ok(Event::default().data("[DONE]")),
                ]);
                Sse::new(events)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn handler_for(addr: SocketAddr, kp: &KeyPair) -> OhttpHandler {
        let backend = AiClient::new(format!("http://{addr}"), None, HashMap::new()).unwrap();
        OhttpHandler::new(kp.key_id(), &kp.private_bytes(), kp.public_key(), backend).unwrap()
    }

    fn sealed_request(kp: &KeyPair) -> (Vec<u8>, veilgate_crypto::ClientContext) {
        let client = OhttpClient::new(kp.key_id(), kp.public_key()).unwrap();
        let req = HttpRequest::new("POST", "/v1/chat/completions")
            .header("Content-Type", "application/json")
            .body(br#"{"model":"x"}"#.to_vec());
        client.encapsulate_request(&req).unwrap()
    }

    #[tokio::test]
    async fn test_process_request_roundtrip() {
        let kp = KeyPair::generate();
        let addr = spawn_json_backend(200).await;
        let handler = handler_for(addr, &kp);

        let (sealed, ctx) = sealed_request(&kp);
        let sealed_resp = handler.process_request(&sealed).await.unwrap();

        let resp = ctx.decapsulate_response(&sealed_resp).unwrap();
        assert_eq!(resp.status, 200);
        assert!(String::from_utf8_lossy(&resp.body).contains("hi"));
    }

    #[tokio::test]
    async fn test_process_request_backend_error_status_is_encapsulated() {
        let kp = KeyPair::generate();
        let addr = spawn_json_backend(503).await;
        let handler = handler_for(addr, &kp);

        let (sealed, ctx) = sealed_request(&kp);
        let sealed_resp = handler.process_request(&sealed).await.unwrap();
        let resp = ctx.decapsulate_response(&sealed_resp).unwrap();
        assert_eq!(resp.status, 503);
    }

    #[tokio::test]
    async fn test_process_request_unreachable_backend_becomes_502() {
        let kp = KeyPair::generate();
        let backend = AiClient::new("http://127.0.0.1:1", None, HashMap::new()).unwrap();
        let handler =
            OhttpHandler::new(kp.key_id(), &kp.private_bytes(), kp.public_key(), backend).unwrap();

        let (sealed, ctx) = sealed_request(&kp);
        let sealed_resp = handler.process_request(&sealed).await.unwrap();
        let resp = ctx.decapsulate_response(&sealed_resp).unwrap();
        assert_eq!(resp.status, 502);
        assert!(String::from_utf8_lossy(&resp.body).contains("AI backend unavailable"));
    }

    #[tokio::test]
    async fn test_process_request_rejects_garbage() {
        let kp = KeyPair::generate();
        let addr = spawn_json_backend(200).await;
        let handler = handler_for(addr, &kp);

        assert!(handler.process_request(&[0u8; 64]).await.is_err());
    }

    #[tokio::test]
    async fn test_process_stream_request_emits_decryptable_chunks() {
        let kp = KeyPair::generate();
        let addr = spawn_sse_backend().await;
        let handler = handler_for(addr, &kp);

        let (sealed, ctx) = sealed_request(&kp);
        let decryptor = ctx.into_stream_decryptor().unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(256 * 1024);
        handler.process_stream_request(&sealed, &mut tx).await.unwrap();
        drop(tx);

        let mut combined = String::new();
        let mut chunks = 0;
        loop {
            match read_message(&mut rx).await.unwrap() {
                Message::StreamChunk { payload } => {
                    let plain = decryptor.decrypt_chunk(&payload).unwrap();
                    combined.push_str(&String::from_utf8_lossy(&plain));
                    chunks += 1;
                }
                Message::StreamEnd => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }

        assert_eq!(chunks, 3);
        assert!(combined.contains("A"));
        assert!(combined.contains("B"));
        assert!(combined.contains("[DONE]"));
    }

    #[tokio::test]
    async fn test_process_stream_request_backend_error_status() {
        let kp = KeyPair::generate();
        let addr = spawn_json_backend(500).await;
        let handler = handler_for(addr, &kp);

        let (sealed, _) = sealed_request(&kp);
        let (mut tx, _rx) = tokio::io::duplex(1024);
        let err = handler
            .process_stream_request(&sealed, &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExitError::BackendStatus { status: 500 }));
    }
}
