//! Stream chunk cipher for SSE responses
//!
//! Both sides derive the same chunk key from their OHTTP context via a
//! second export with a distinct label. Each chunk is sealed with a fresh
//! random 12-byte GCM nonce carried in front of the ciphertext, so no
//! (key, nonce) pair repeats, two encryptions of the same plaintext
//! differ, and every chunk authenticates independently. The relay treats
//! chunks as opaque bytes.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes128Gcm;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::hpke::{Context, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::{CryptoError, Result};

const STREAM_EXPORT_LABEL: &[u8] = b"message/bhttp stream";

fn stream_cipher(ctx: &Context) -> Result<Aes128Gcm> {
    let key = ctx.export(STREAM_EXPORT_LABEL, KEY_SIZE)?;
    Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::DerivationFailed)
}

/// Exit-side chunk encryptor, derived from a consumed [`ServerContext`].
///
/// [`ServerContext`]: crate::ServerContext
pub struct StreamEncryptor {
    cipher: Aes128Gcm,
}

impl StreamEncryptor {
    pub(crate) fn from_context(ctx: &Context) -> Result<Self> {
        Ok(Self {
            cipher: stream_cipher(ctx)?,
        })
    }

    /// Seal one SSE event. Output: `nonce(12) || ct`.
    pub fn encrypt_chunk(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ct = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }
}

/// Client-side chunk decryptor, derived from a consumed [`ClientContext`].
///
/// [`ClientContext`]: crate::ClientContext
pub struct StreamDecryptor {
    cipher: Aes128Gcm,
}

impl StreamDecryptor {
    pub(crate) fn from_context(ctx: &Context) -> Result<Self> {
        Ok(Self {
            cipher: stream_cipher(ctx)?,
        })
    }

    /// Open one chunk; a corrupt chunk fails authentication and the caller
    /// aborts the stream.
    pub fn decrypt_chunk(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::ChunkTooShort);
        }
        let (nonce, ct) = data.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(GenericArray::from_slice(nonce), ct)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
