//! Inner HTTP request/response model
//!
//! These are the plaintext values carried inside OHTTP ciphertexts. The
//! binary codec is length-prefixed throughout so arbitrary header values
//! and binary bodies round-trip exactly, and header order is preserved.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HttpCodecError {
    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("{0} too long")]
    FieldTooLong(&'static str),

    #[error("{0} is not valid utf-8")]
    InvalidUtf8(&'static str),
}

/// An HTTP request in transit through the tunnel.
///
/// `path` carries the full request target including the query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.path.len() + self.body.len());
        put_str_u8(&mut buf, &self.method);
        put_str_u16(&mut buf, &self.path);
        put_headers(&mut buf, &self.headers);
        put_bytes_u32(&mut buf, &self.body);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HttpCodecError> {
        let mut rest = data;
        let method = take_str_u8(&mut rest, "method")?;
        let path = take_str_u16(&mut rest, "path")?;
        let headers = take_headers(&mut rest)?;
        let body = take_bytes_u32(&mut rest, "body")?;
        Ok(Self {
            method,
            path,
            headers,
            body,
        })
    }
}

/// An HTTP response in transit back through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.body.len());
        buf.extend_from_slice(&self.status.to_be_bytes());
        put_headers(&mut buf, &self.headers);
        put_bytes_u32(&mut buf, &self.body);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HttpCodecError> {
        let mut rest = data;
        let status_bytes = take(&mut rest, 2, "status")?;
        let status = u16::from_be_bytes([status_bytes[0], status_bytes[1]]);
        let headers = take_headers(&mut rest)?;
        let body = take_bytes_u32(&mut rest, "body")?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

fn put_str_u8(buf: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u8::MAX as usize);
    buf.push(len as u8);
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn put_str_u16(buf: &mut Vec<u8>, s: &str) {
    let len = s.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn put_bytes_u32(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

fn put_headers(buf: &mut Vec<u8>, headers: &[(String, String)]) {
    let count = headers.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(count as u16).to_be_bytes());
    for (name, value) in headers.iter().take(count) {
        put_str_u16(buf, name);
        put_str_u16(buf, value);
    }
}

fn take<'a>(
    rest: &mut &'a [u8],
    n: usize,
    field: &'static str,
) -> Result<&'a [u8], HttpCodecError> {
    if rest.len() < n {
        return Err(HttpCodecError::Truncated(field));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_str_u8(rest: &mut &[u8], field: &'static str) -> Result<String, HttpCodecError> {
    let len = take(rest, 1, field)?[0] as usize;
    let raw = take(rest, len, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| HttpCodecError::InvalidUtf8(field))
}

fn take_str_u16(rest: &mut &[u8], field: &'static str) -> Result<String, HttpCodecError> {
    let len_bytes = take(rest, 2, field)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let raw = take(rest, len, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| HttpCodecError::InvalidUtf8(field))
}

fn take_bytes_u32(rest: &mut &[u8], field: &'static str) -> Result<Vec<u8>, HttpCodecError> {
    let len_bytes = take(rest, 4, field)?;
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let raw = take(rest, len, field)?;
    Ok(raw.to_vec())
}

fn take_headers(rest: &mut &[u8]) -> Result<Vec<(String, String)>, HttpCodecError> {
    let count_bytes = take(rest, 2, "header count")?;
    let count = u16::from_be_bytes([count_bytes[0], count_bytes[1]]) as usize;
    let mut headers = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let name = take_str_u16(rest, "header name")?;
        let value = take_str_u16(rest, "header value")?;
        headers.push((name, value));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let req = HttpRequest::new("POST", "/v1/chat/completions?beta=1")
            .header("Content-Type", "application/json")
            .header("X-Custom", "value with spaces")
            .body(br#"{"model":"x","messages":[]}"#.to_vec());

        let decoded = HttpRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_request_roundtrip_binary_body() {
        let req = HttpRequest::new("PUT", "/upload").body(vec![0u8, 255, 10, 13, 0, 7]);
        let decoded = HttpRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded.body, vec![0u8, 255, 10, 13, 0, 7]);
    }

    #[test]
    fn test_request_roundtrip_empty() {
        let req = HttpRequest::new("GET", "/");
        let decoded = HttpRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(decoded, req);
        assert!(decoded.headers.is_empty());
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = HttpResponse::new(
            502,
            vec![("Content-Type".into(), "application/json".into())],
            br#"{"error":"bad gateway"}"#.to_vec(),
        );
        let decoded = HttpResponse::from_bytes(&resp.to_bytes()).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_header_order_preserved() {
        let req = HttpRequest::new("GET", "/")
            .header("A", "1")
            .header("B", "2")
            .header("A", "3");
        let decoded = HttpRequest::from_bytes(&req.to_bytes()).unwrap();
        assert_eq!(
            decoded.headers,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let resp = HttpResponse::new(
            200,
            vec![("Content-Type".into(), "text/event-stream".into())],
            Vec::new(),
        );
        assert_eq!(resp.header_value("content-type"), Some("text/event-stream"));
        assert_eq!(resp.header_value("CONTENT-TYPE"), Some("text/event-stream"));
        assert_eq!(resp.header_value("accept"), None);
    }

    #[test]
    fn test_from_bytes_truncated() {
        assert!(HttpRequest::from_bytes(&[]).is_err());
        assert!(HttpRequest::from_bytes(&[4, b'P', b'O']).is_err());
        assert!(HttpResponse::from_bytes(&[0]).is_err());

        // Valid prefix with body length claiming more than available.
        let mut data = HttpRequest::new("GET", "/x").to_bytes();
        let n = data.len();
        data[n - 4..].copy_from_slice(&100u32.to_be_bytes());
        assert!(HttpRequest::from_bytes(&data).is_err());
    }
}
