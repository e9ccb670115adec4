//! Veilgate Core
//!
//! Shared building blocks used by every role:
//! - the inner HTTP request/response model that the OHTTP layer seals,
//!   with its length-prefixed binary codec
//! - TLS helpers: self-signed server configs and the client-side
//!   verifiers (fingerprint-pinned or insecure-skip)

pub mod http;
pub mod tls;

pub use http::{HttpCodecError, HttpRequest, HttpResponse};
pub use tls::TlsError;
