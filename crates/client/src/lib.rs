//! Veilgate Client
//!
//! The client encrypts every request end-to-end against the chosen exit's
//! public key and sends it through the relay, which routes by public-key
//! hash without being able to read anything. A local HTTP proxy front-end
//! makes the whole path transparent to OpenAI-compatible tooling.

mod client;
mod proxy;

use thiserror::Error;

use veilgate_crypto::CryptoError;
use veilgate_protocol::ProtocolError;

pub use client::{Client, ClientConfig, StreamResponse};
pub use proxy::{detect_streaming, LocalProxy, ProxyConfig};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("relay address not set")]
    NoRelayAddress,

    #[error("no exit configured")]
    NoExitConfigured,

    #[error("invalid relay address: {0}")]
    InvalidRelayAddr(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay error: {0}")]
    Remote(String),

    #[error("unexpected message type 0x{0:02x}")]
    UnexpectedMessage(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
