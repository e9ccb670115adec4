//! HPKE base mode (RFC 9180) for one fixed suite
//!
//! Only the combination this system runs is implemented:
//! DHKEM(X25519, HKDF-SHA256), HKDF-SHA256, AES-128-GCM. The corpus carries
//! the primitives (x25519-dalek, hkdf, aes-gcm) but no HPKE crate, so the
//! key schedule is built here directly from the RFC's labeled KDF.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::{CryptoError, Result};

/// DHKEM(X25519, HKDF-SHA256)
pub const KEM_ID: u16 = 0x0020;
/// HKDF-SHA256
pub const KDF_ID: u16 = 0x0001;
/// AES-128-GCM
pub const AEAD_ID: u16 = 0x0001;

/// Size of the encapsulated KEM share (an X25519 public key).
pub const ENC_SIZE: usize = 32;
pub const KEY_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

const KEM_SUITE_ID: [u8; 5] = [b'K', b'E', b'M', 0x00, 0x20];
const HPKE_SUITE_ID: [u8; 10] = [
    b'H', b'P', b'K', b'E', 0x00, 0x20, 0x00, 0x01, 0x00, 0x01,
];
const MODE_BASE: u8 = 0x00;

fn labeled_extract(suite_id: &[u8], salt: &[u8], label: &str, ikm: &[u8]) -> [u8; 32] {
    let mut labeled_ikm = Vec::with_capacity(7 + suite_id.len() + label.len() + ikm.len());
    labeled_ikm.extend_from_slice(b"HPKE-v1");
    labeled_ikm.extend_from_slice(suite_id);
    labeled_ikm.extend_from_slice(label.as_bytes());
    labeled_ikm.extend_from_slice(ikm);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), &labeled_ikm);
    prk.into()
}

fn labeled_expand(
    suite_id: &[u8],
    prk: &[u8; 32],
    label: &str,
    info: &[u8],
    out: &mut [u8],
) -> Result<()> {
    let mut labeled_info = Vec::with_capacity(9 + suite_id.len() + label.len() + info.len());
    labeled_info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    labeled_info.extend_from_slice(b"HPKE-v1");
    labeled_info.extend_from_slice(suite_id);
    labeled_info.extend_from_slice(label.as_bytes());
    labeled_info.extend_from_slice(info);
    Hkdf::<Sha256>::from_prk(prk)
        .map_err(|_| CryptoError::DerivationFailed)?
        .expand(&labeled_info, out)
        .map_err(|_| CryptoError::DerivationFailed)
}

/// ExtractAndExpand over the KEM shared secret.
fn kem_shared_secret(dh: &[u8], kem_context: &[u8]) -> Result<[u8; 32]> {
    let eae_prk = labeled_extract(&KEM_SUITE_ID, b"", "eae_prk", dh);
    let mut shared = [0u8; 32];
    labeled_expand(&KEM_SUITE_ID, &eae_prk, "shared_secret", kem_context, &mut shared)?;
    Ok(shared)
}

/// AEAD context bound to one encapsulation.
///
/// Holds the schedule outputs: the sequence-nonced cipher used for the
/// request, and the exporter secret that derives the response key and the
/// stream chunk key.
pub struct Context {
    cipher: Aes128Gcm,
    base_nonce: [u8; NONCE_SIZE],
    seq: u64,
    exporter_secret: [u8; 32],
}

impl Context {
    fn from_shared_secret(shared_secret: &[u8; 32]) -> Result<Self> {
        let psk_id_hash = labeled_extract(&HPKE_SUITE_ID, b"", "psk_id_hash", b"");
        let info_hash = labeled_extract(&HPKE_SUITE_ID, b"", "info_hash", b"");

        let mut ks_context = Vec::with_capacity(1 + 64);
        ks_context.push(MODE_BASE);
        ks_context.extend_from_slice(&psk_id_hash);
        ks_context.extend_from_slice(&info_hash);

        let secret = labeled_extract(&HPKE_SUITE_ID, shared_secret, "secret", b"");

        let mut key = [0u8; KEY_SIZE];
        labeled_expand(&HPKE_SUITE_ID, &secret, "key", &ks_context, &mut key)?;
        let mut base_nonce = [0u8; NONCE_SIZE];
        labeled_expand(&HPKE_SUITE_ID, &secret, "base_nonce", &ks_context, &mut base_nonce)?;
        let mut exporter_secret = [0u8; 32];
        labeled_expand(&HPKE_SUITE_ID, &secret, "exp", &ks_context, &mut exporter_secret)?;

        let cipher =
            Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::DerivationFailed)?;

        Ok(Self {
            cipher,
            base_nonce,
            seq: 0,
            exporter_secret,
        })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = self.base_nonce;
        let seq = self.seq.to_be_bytes();
        for (n, s) in nonce[NONCE_SIZE - 8..].iter_mut().zip(seq.iter()) {
            *n ^= s;
        }
        self.seq += 1;
        nonce
    }

    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// RFC 9180 secret export; both ends of one encapsulation derive the
    /// same bytes for the same context string.
    pub fn export(&self, exporter_context: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        labeled_expand(
            &HPKE_SUITE_ID,
            &self.exporter_secret,
            "sec",
            exporter_context,
            &mut out,
        )?;
        Ok(out)
    }
}

/// Sender-side setup against the recipient's public key.
///
/// Returns the encapsulated share to transmit and the sealing context.
pub fn setup_sender(recipient_public: &[u8; 32]) -> Result<([u8; ENC_SIZE], Context)> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let enc: [u8; 32] = PublicKey::from(&ephemeral).to_bytes();
    let dh = ephemeral.diffie_hellman(&PublicKey::from(*recipient_public));

    let mut kem_context = [0u8; 64];
    kem_context[..32].copy_from_slice(&enc);
    kem_context[32..].copy_from_slice(recipient_public);

    let shared = kem_shared_secret(dh.as_bytes(), &kem_context)?;
    Ok((enc, Context::from_shared_secret(&shared)?))
}

/// Receiver-side setup from the transmitted share and the private key.
pub fn setup_receiver(enc: &[u8], secret: &StaticSecret) -> Result<Context> {
    let enc: [u8; 32] = enc
        .try_into()
        .map_err(|_| CryptoError::RequestTooShort)?;
    let dh = secret.diffie_hellman(&PublicKey::from(enc));

    let mut kem_context = [0u8; 64];
    kem_context[..32].copy_from_slice(&enc);
    kem_context[32..].copy_from_slice(&PublicKey::from(secret).to_bytes());

    let shared = kem_shared_secret(dh.as_bytes(), &kem_context)?;
    Context::from_shared_secret(&shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn keypair() -> (StaticSecret, [u8; 32]) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        (secret, public)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (secret, public) = keypair();
        let (enc, mut sender) = setup_sender(&public).unwrap();
        let mut receiver = setup_receiver(&enc, &secret).unwrap();

        let ct = sender.seal(b"aad", b"hello hpke").unwrap();
        let pt = receiver.open(b"aad", &ct).unwrap();
        assert_eq!(pt, b"hello hpke");
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let (secret, public) = keypair();
        let (enc, mut sender) = setup_sender(&public).unwrap();
        let mut receiver = setup_receiver(&enc, &secret).unwrap();

        let ct = sender.seal(b"aad", b"data").unwrap();
        assert!(matches!(
            receiver.open(b"other", &ct),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let (_, public) = keypair();
        let (wrong_secret, _) = keypair();
        let (enc, mut sender) = setup_sender(&public).unwrap();
        let mut receiver = setup_receiver(&enc, &wrong_secret).unwrap();

        let ct = sender.seal(b"", b"data").unwrap();
        assert!(receiver.open(b"", &ct).is_err());
    }

    #[test]
    fn test_export_matches_on_both_sides() {
        let (secret, public) = keypair();
        let (enc, sender) = setup_sender(&public).unwrap();
        let receiver = setup_receiver(&enc, &secret).unwrap();

        let a = sender.export(b"message/bhttp response", 16).unwrap();
        let b = receiver.export(b"message/bhttp response", 16).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        // Different context strings give independent secrets.
        let c = sender.export(b"message/bhttp stream", 16).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_sequence_nonces_differ() {
        let (_, public) = keypair();
        let (_, mut sender) = setup_sender(&public).unwrap();
        let ct1 = sender.seal(b"", b"same").unwrap();
        let ct2 = sender.seal(b"", b"same").unwrap();
        assert_ne!(ct1, ct2);
    }
}
