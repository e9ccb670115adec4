//! Exit key material and the KeyConfig advertisement codec

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::hpke::{AEAD_ID, KDF_ID, KEM_ID};
use crate::{CryptoError, Result};

/// Long-lived exit keypair: an X25519 KEM pair plus the random 8-bit
/// KeyID chosen at generation time.
pub struct KeyPair {
    secret: StaticSecret,
    public: [u8; 32],
    key_id: u8,
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        let secret = StaticSecret::from(*self.secret.as_bytes());
        Self {
            secret,
            public: self.public,
            key_id: self.key_id,
        }
    }
}

impl KeyPair {
    /// Generate a fresh keypair with a uniformly random KeyID.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let mut key_id = [0u8; 1];
        OsRng.fill_bytes(&mut key_id);
        Self {
            secret,
            public,
            key_id: key_id[0],
        }
    }

    /// Rebuild a keypair from its persisted private bytes and KeyID.
    pub fn from_private_bytes(private: &[u8], key_id: u8) -> Result<Self> {
        let bytes: [u8; 32] = private
            .try_into()
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret).to_bytes();
        Ok(Self {
            secret,
            public,
            key_id,
        })
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        *self.secret.as_bytes()
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Canonical KeyConfig advertisement of the public half.
    pub fn key_config(&self) -> Vec<u8> {
        encode_key_config(self.key_id, &self.public)
    }

    /// Routing identifier derived from the public key.
    pub fn pub_key_hash(&self) -> String {
        pub_key_hash(&self.public)
    }
}

/// Stable routing identifier for an exit public key: lowercase hex of
/// SHA-256 over the raw key bytes.
pub fn pub_key_hash(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Encode a KeyConfig:
/// `KeyID(1) || KEM_ID(2) || PublicKeyLen(2) || PublicKey || CipherSuiteLen(2) || [KDF_ID(2) || AEAD_ID(2)]`
pub fn encode_key_config(key_id: u8, public_key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 2 + 2 + public_key.len() + 2 + 4);
    buf.push(key_id);
    buf.extend_from_slice(&KEM_ID.to_be_bytes());
    buf.extend_from_slice(&(public_key.len() as u16).to_be_bytes());
    buf.extend_from_slice(public_key);
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&KDF_ID.to_be_bytes());
    buf.extend_from_slice(&AEAD_ID.to_be_bytes());
    buf
}

/// Decode a KeyConfig back to its KeyID and raw public key.
pub fn decode_key_config(data: &[u8]) -> Result<(u8, Vec<u8>)> {
    if data.len() < 7 {
        return Err(CryptoError::KeyConfigTooShort);
    }
    let key_id = data[0];
    let pub_key_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if data.len() < 5 + pub_key_len {
        return Err(CryptoError::PublicKeyIncomplete);
    }
    Ok((key_id, data[5..5 + pub_key_len].to_vec()))
}

/// Decode a base64-encoded KeyConfig (the persisted / advertised form).
pub fn decode_key_config_b64(encoded: &str) -> Result<(u8, Vec<u8>)> {
    let data = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidBase64)?;
    decode_key_config(&data)
}
