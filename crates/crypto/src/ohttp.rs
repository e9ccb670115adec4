//! OHTTP request/response encapsulation
//!
//! Request layout: `KeyID(1) || KEM_ID(2) || KDF_ID(2) || AEAD_ID(2) || enc(32) || ct`.
//! The 7-byte header doubles as the AEAD associated data.
//!
//! Response layout: `responseNonce(16) || gcmNonce(12) || ct`, sealed with
//! AES-128-GCM under a key derived by XOR-ing the response nonce into an
//! HPKE export, so each response uses fresh key material without a second
//! key exchange.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes128Gcm;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::StaticSecret;

use veilgate_core::{HttpRequest, HttpResponse};

use crate::hpke::{self, AEAD_ID, ENC_SIZE, KDF_ID, KEM_ID, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::stream::{StreamDecryptor, StreamEncryptor};
use crate::{CryptoError, Result};

/// `KeyID(1) || KEM_ID(2) || KDF_ID(2) || AEAD_ID(2)`
pub const REQUEST_HEADER_SIZE: usize = 7;

const RESPONSE_EXPORT_LABEL: &[u8] = b"message/bhttp response";
const RESPONSE_NONCE_SIZE: usize = 16;

fn request_header(key_id: u8) -> [u8; REQUEST_HEADER_SIZE] {
    let mut header = [0u8; REQUEST_HEADER_SIZE];
    header[0] = key_id;
    header[1..3].copy_from_slice(&KEM_ID.to_be_bytes());
    header[3..5].copy_from_slice(&KDF_ID.to_be_bytes());
    header[5..7].copy_from_slice(&AEAD_ID.to_be_bytes());
    header
}

/// Derive the response AEAD from an HPKE context and a 16-byte nonce.
fn response_cipher(ctx: &hpke::Context, response_nonce: &[u8]) -> Result<Aes128Gcm> {
    let exported = ctx.export(RESPONSE_EXPORT_LABEL, KEY_SIZE)?;
    let mut key = [0u8; KEY_SIZE];
    for (i, k) in key.iter_mut().enumerate() {
        *k = exported[i] ^ response_nonce[i];
    }
    Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::DerivationFailed)
}

/// Client-side encapsulator bound to one exit's advertised key.
#[derive(Clone)]
pub struct OhttpClient {
    key_id: u8,
    public_key: [u8; 32],
}

impl OhttpClient {
    pub fn new(key_id: u8, public_key: &[u8]) -> Result<Self> {
        let public_key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { key_id, public_key })
    }

    /// Seal a request for the exit. The returned [`ClientContext`] is the
    /// only way to open the matching response.
    pub fn encapsulate_request(&self, req: &HttpRequest) -> Result<(Vec<u8>, ClientContext)> {
        let req_bytes = req.to_bytes();
        let header = request_header(self.key_id);

        let (enc, mut ctx) = hpke::setup_sender(&self.public_key)?;
        let ct = ctx.seal(&header, &req_bytes)?;

        let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + ENC_SIZE + ct.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&enc);
        out.extend_from_slice(&ct);

        Ok((out, ClientContext { hpke: ctx }))
    }
}

/// Per-request client state, consumed by its single use: either opening
/// the unary response or deriving the stream decryptor.
pub struct ClientContext {
    hpke: hpke::Context,
}

impl ClientContext {
    pub fn decapsulate_response(self, data: &[u8]) -> Result<HttpResponse> {
        if data.len() < RESPONSE_NONCE_SIZE + NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::ResponseTooShort);
        }
        let response_nonce = &data[..RESPONSE_NONCE_SIZE];
        let cipher = response_cipher(&self.hpke, response_nonce)?;

        let gcm_nonce = &data[RESPONSE_NONCE_SIZE..RESPONSE_NONCE_SIZE + NONCE_SIZE];
        let ct = &data[RESPONSE_NONCE_SIZE + NONCE_SIZE..];
        let plaintext = cipher
            .decrypt(GenericArray::from_slice(gcm_nonce), ct)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        Ok(HttpResponse::from_bytes(&plaintext)?)
    }

    pub fn into_stream_decryptor(self) -> Result<StreamDecryptor> {
        StreamDecryptor::from_context(&self.hpke)
    }
}

/// Server-side decapsulator holding the exit's private key.
pub struct OhttpServer {
    key_id: u8,
    secret: StaticSecret,
}

impl OhttpServer {
    pub fn new(key_id: u8, private_key: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = private_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self {
            key_id,
            secret: StaticSecret::from(bytes),
        })
    }

    pub fn decapsulate_request(&self, data: &[u8]) -> Result<(HttpRequest, ServerContext)> {
        if data.len() < REQUEST_HEADER_SIZE + ENC_SIZE {
            return Err(CryptoError::RequestTooShort);
        }

        let key_id = data[0];
        if key_id != self.key_id {
            return Err(CryptoError::KeyIdMismatch {
                expected: self.key_id,
                got: key_id,
            });
        }

        let kem_id = u16::from_be_bytes([data[1], data[2]]);
        let kdf_id = u16::from_be_bytes([data[3], data[4]]);
        let aead_id = u16::from_be_bytes([data[5], data[6]]);
        if kem_id != KEM_ID || kdf_id != KDF_ID || aead_id != AEAD_ID {
            return Err(CryptoError::UnsupportedSuite);
        }

        let aad = &data[..REQUEST_HEADER_SIZE];
        let enc = &data[REQUEST_HEADER_SIZE..REQUEST_HEADER_SIZE + ENC_SIZE];
        let ct = &data[REQUEST_HEADER_SIZE + ENC_SIZE..];

        let mut ctx = hpke::setup_receiver(enc, &self.secret)?;
        let req_bytes = ctx.open(aad, ct)?;
        let req = HttpRequest::from_bytes(&req_bytes)?;

        Ok((req, ServerContext { hpke: ctx }))
    }
}

/// Per-request server state, consumed by its single use: either sealing
/// the unary response or deriving the stream encryptor.
pub struct ServerContext {
    hpke: hpke::Context,
}

impl ServerContext {
    pub fn encapsulate_response(self, resp: &HttpResponse) -> Result<Vec<u8>> {
        let resp_bytes = resp.to_bytes();

        let mut response_nonce = [0u8; RESPONSE_NONCE_SIZE];
        OsRng.fill_bytes(&mut response_nonce);
        let cipher = response_cipher(&self.hpke, &response_nonce)?;

        let mut gcm_nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut gcm_nonce);
        let ct = cipher
            .encrypt(GenericArray::from_slice(&gcm_nonce), resp_bytes.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(RESPONSE_NONCE_SIZE + NONCE_SIZE + ct.len());
        out.extend_from_slice(&response_nonce);
        out.extend_from_slice(&gcm_nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn into_stream_encryptor(self) -> Result<StreamEncryptor> {
        StreamEncryptor::from_context(&self.hpke)
    }
}
