//! AI backend HTTP client
//!
//! Rewrites decapsulated requests against the configured backend URL.
//! Unary requests use a client with an overall deadline; streaming
//! requests use a client with no overall deadline but a connect cap, and
//! the send future is bounded so response headers must arrive promptly.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use veilgate_core::{HttpRequest, HttpResponse};

use crate::{ExitError, Result};

const UNARY_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// True for headers that must not cross the proxy hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// True when a response announces an SSE body.
pub fn is_sse_content_type(content_type: &str) -> bool {
    content_type.starts_with("text/event-stream")
}

pub struct AiClient {
    base_url: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    stream_http: reqwest::Client,
}

impl AiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        headers: HashMap<String, String>,
    ) -> Result<Self> {
        veilgate_core::tls::install_crypto_provider();
        let http = reqwest::Client::builder()
            .timeout(UNARY_TIMEOUT)
            .build()?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            api_key,
            headers,
            http,
            stream_http,
        })
    }

    /// Headers for the outbound request: the inner request's headers minus
    /// hop-by-hop ones; configured headers replace matching incoming ones
    /// and suppress API-key injection.
    fn outbound_headers(&self, req: &HttpRequest) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = req
            .headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .cloned()
            .collect();

        if !self.headers.is_empty() {
            for (name, value) in &self.headers {
                headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
                headers.push((name.clone(), value.clone()));
            }
        } else if let Some(key) = &self.api_key {
            headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case("authorization"));
            headers.push(("Authorization".to_string(), format!("Bearer {key}")));
        }

        headers
    }

    fn build_request(
        &self,
        req: &HttpRequest,
        client: &reqwest::Client,
    ) -> Result<reqwest::RequestBuilder> {
        let url = format!("{}{}", self.base_url, req.path);
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| ExitError::InvalidRequest(format!("unsupported method: {}", req.method)))?;

        let mut builder = client.request(method, &url);
        for (name, value) in self.outbound_headers(req) {
            builder = builder.header(name, value);
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body.clone());
        }
        Ok(builder)
    }

    /// Forward a unary request. Backend-side HTTP errors (including 5xx)
    /// come back as ordinary responses.
    pub async fn forward(&self, req: &HttpRequest) -> Result<HttpResponse> {
        debug!("forwarding {} {} to backend", req.method, req.path);
        let resp = self.build_request(req, &self.http)?.send().await?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp.bytes().await?.to_vec();

        Ok(HttpResponse::new(status, headers, body))
    }

    /// Forward a streaming request, returning the live response once its
    /// headers arrive (bounded by the header deadline).
    pub async fn forward_stream(&self, req: &HttpRequest) -> Result<reqwest::Response> {
        debug!("forwarding streaming {} {} to backend", req.method, req.path);
        let builder = self.build_request(req, &self.stream_http)?;
        match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, builder.send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ExitError::BackendTimeout),
        }
    }
}
