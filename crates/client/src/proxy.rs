//! Local HTTP proxy front-end
//!
//! Accepts any method and path on a loopback listener and tunnels the
//! whole request verbatim, so OpenAI-compatible (and similar) JSON APIs
//! work without the client parsing their schemas. Streaming is detected
//! with a deliberately cheap three-way test, never a full body parse.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use veilgate_core::HttpRequest;

use crate::client::{Client, StreamResponse};
use crate::Result;

/// Matches the wire payload cap; larger bodies could never be tunneled.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().expect("valid default address"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct ProxyState {
    client: Arc<Client>,
    request_timeout: Duration,
}

/// Local HTTP server in front of a [`Client`].
pub struct LocalProxy {
    client: Arc<Client>,
    config: ProxyConfig,
    cancel: CancellationToken,
}

impl LocalProxy {
    pub fn new(client: Arc<Client>, config: ProxyConfig) -> Self {
        Self {
            client,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Serve until `shutdown` is called.
    pub async fn serve(&self) -> Result<()> {
        let state = Arc::new(ProxyState {
            client: Arc::clone(&self.client),
            request_timeout: self.config.request_timeout,
        });
        let app = Router::new()
            .fallback(handle_request)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.config.listen).await?;
        info!("local proxy listening on {}", self.config.listen);

        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Unified entry point: every method, every path.
async fn handle_request(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let accept = req
        .headers()
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(_) => return error_response(400, "failed to read request body"),
    };

    let inner = HttpRequest {
        method,
        path: path.clone(),
        headers,
        body: body.to_vec(),
    };

    if detect_streaming(&inner.body, &path, &accept) {
        handle_streaming(state, inner).await
    } else {
        handle_unary(state, inner).await
    }
}

async fn handle_unary(state: Arc<ProxyState>, inner: HttpRequest) -> Response {
    let result = tokio::time::timeout(state.request_timeout, state.client.send_request(&inner)).await;
    match result {
        Ok(Ok(resp)) => {
            let content_type = resp
                .header_value("content-type")
                .unwrap_or("application/json")
                .to_string();
            Response::builder()
                .status(resp.status)
                .header(CONTENT_TYPE, content_type)
                .body(Body::from(resp.body))
                .unwrap_or_else(|_| error_response(502, "request forwarding failed"))
        }
        Ok(Err(e)) => {
            warn!("request failed: {e}");
            error_response(502, "request forwarding failed")
        }
        Err(_) => {
            warn!("request timed out after {:?}", state.request_timeout);
            error_response(502, "request forwarding failed")
        }
    }
}

async fn handle_streaming(state: Arc<ProxyState>, inner: HttpRequest) -> Response {
    let stream_resp = match state.client.send_stream_request(&inner).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("streaming request failed: {e}");
            return error_response(502, "AI service request failed");
        }
    };

    let body_stream = futures::stream::unfold(
        Some(stream_resp),
        |sr: Option<StreamResponse>| async move {
            let mut sr = sr?;
            match sr.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok::<_, std::io::Error>(Bytes::from(chunk)), Some(sr))),
                Ok(None) => None,
                Err(e) => {
                    warn!("reading stream chunk failed: {e}");
                    Some((Err(std::io::Error::other(e.to_string())), None))
                }
            }
        },
    );

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| error_response(502, "AI service request failed"))
}

/// Streaming detection, in order:
/// 1. body contains `"stream":true` (byte match, not a JSON parse)
/// 2. path contains `stream` (covers e.g. streamGenerateContent)
/// 3. Accept header contains `text/event-stream`
pub fn detect_streaming(body: &[u8], path: &str, accept: &str) -> bool {
    if !body.is_empty()
        && (contains(body, br#""stream":true"#) || contains(body, br#""stream": true"#))
    {
        return true;
    }
    if path.contains("stream") {
        return true;
    }
    accept.contains("text/event-stream")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn error_response(status: u16, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "api_error",
            "code": status.to_string(),
        }
    });
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}
