//! Veilgate Crypto
//!
//! The oblivious request/response crypto core:
//! - HPKE base mode for the fixed suite
//!   DHKEM(X25519, HKDF-SHA256) / HKDF-SHA256 / AES-128-GCM
//! - OHTTP request/response encapsulation with the 7-byte header AAD
//! - KeyConfig encoding and the public-key routing hash
//! - the incremental stream chunk cipher derived from the same context
//!
//! The relay only ever sees the ciphertexts produced here; the exit holds
//! the private half and is the only party able to open them.

pub mod hpke;
mod keys;
mod ohttp;
mod stream;

use thiserror::Error;

pub use keys::{decode_key_config, decode_key_config_b64, encode_key_config, pub_key_hash, KeyPair};
pub use ohttp::{ClientContext, OhttpClient, OhttpServer, ServerContext, REQUEST_HEADER_SIZE};
pub use stream::{StreamDecryptor, StreamEncryptor};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key config too short")]
    KeyConfigTooShort,

    #[error("public key incomplete")]
    PublicKeyIncomplete,

    #[error("invalid public key length")]
    InvalidPublicKey,

    #[error("invalid private key length")]
    InvalidPrivateKey,

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("keyID mismatch: expected {expected}, got {got}")]
    KeyIdMismatch { expected: u8, got: u8 },

    #[error("unsupported cipher suite")]
    UnsupportedSuite,

    #[error("request data too short")]
    RequestTooShort,

    #[error("response data too short")]
    ResponseTooShort,

    #[error("chunk too short")]
    ChunkTooShort,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key derivation failed")]
    DerivationFailed,

    #[error(transparent)]
    Http(#[from] veilgate_core::HttpCodecError),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
