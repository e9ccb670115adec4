//! Veilgate Keystore
//!
//! Persists an exit's OHTTP keypair: the private key as base64 raw bytes
//! (mode 0600 on unix), the public half as a base64 KeyConfig in a
//! sibling `.pub` file. The KeyConfig file is exactly what the exit
//! advertises, so it can be handed to clients out of band.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tracing::info;

use veilgate_crypto::{decode_key_config, CryptoError, KeyPair};

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read keyfile: {0}")]
    Read(std::io::Error),

    #[error("failed to write keyfile: {0}")]
    Write(std::io::Error),

    #[error("failed to create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("invalid keyfile format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Expand a leading `~` to the user's home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn public_path(private_path: &Path) -> PathBuf {
    let mut name = private_path.as_os_str().to_os_string();
    name.push(".pub");
    PathBuf::from(name)
}

/// Write both halves of a keypair next to each other.
pub fn save_keypair(keys: &KeyPair, private_path: &Path) -> Result<()> {
    if let Some(parent) = private_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDir)?;
        }
    }

    let private_b64 = BASE64.encode(keys.private_bytes());
    std::fs::write(private_path, private_b64).map_err(KeystoreError::Write)?;
    restrict_permissions(private_path)?;

    let config_b64 = BASE64.encode(keys.key_config());
    std::fs::write(public_path(private_path), config_b64).map_err(KeystoreError::Write)?;

    info!("saved keypair to {:?}", private_path);
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms).map_err(KeystoreError::Write)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Load a keypair from its two files, checking that the persisted public
/// key matches the one derived from the private bytes.
pub fn load_keypair(private_path: &Path) -> Result<KeyPair> {
    let private_b64 = std::fs::read_to_string(private_path).map_err(KeystoreError::Read)?;
    let private = BASE64
        .decode(private_b64.trim())
        .map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;

    let config_b64 =
        std::fs::read_to_string(public_path(private_path)).map_err(KeystoreError::Read)?;
    let config = BASE64
        .decode(config_b64.trim())
        .map_err(|e| KeystoreError::InvalidFormat(e.to_string()))?;
    let (key_id, public) = decode_key_config(&config)?;

    let keys = KeyPair::from_private_bytes(&private, key_id)?;
    if keys.public_key().as_slice() != public.as_slice() {
        return Err(KeystoreError::InvalidFormat(
            "public key does not match private key".to_string(),
        ));
    }

    info!("loaded keypair from {:?}", private_path);
    Ok(keys)
}

/// Load an existing keypair, or generate and persist a fresh one.
pub fn load_or_generate(private_path: &Path) -> Result<KeyPair> {
    if private_path.exists() {
        return load_keypair(private_path);
    }
    let keys = KeyPair::generate();
    save_keypair(&keys, private_path)?;
    info!("generated new keypair at {:?}", private_path);
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_key_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "veilgate-keystore-test-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("ohttp.key")
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = temp_key_path("roundtrip");
        let keys = KeyPair::generate();
        save_keypair(&keys, &path).unwrap();

        let loaded = load_keypair(&path).unwrap();
        assert_eq!(loaded.public_key(), keys.public_key());
        assert_eq!(loaded.key_id(), keys.key_id());
        assert_eq!(loaded.private_bytes(), keys.private_bytes());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let path = temp_key_path("generate");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(public_path(&path));

        let first = load_or_generate(&path).unwrap();
        let second = load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());
        assert_eq!(first.key_id(), second.key_id());
    }

    #[test]
    fn test_load_detects_mismatched_public_key() {
        let path = temp_key_path("mismatch");
        let keys = KeyPair::generate();
        save_keypair(&keys, &path).unwrap();

        // Overwrite the .pub file with a different key's config.
        let other = KeyPair::generate();
        std::fs::write(public_path(&path), BASE64.encode(other.key_config())).unwrap();

        assert!(matches!(
            load_keypair(&path),
            Err(KeystoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let path = PathBuf::from("/nonexistent/veilgate/ohttp.key");
        assert!(matches!(load_keypair(&path), Err(KeystoreError::Read(_))));
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_path(Path::new("~/.veilgate/ohttp.key")),
            PathBuf::from("/home/tester/.veilgate/ohttp.key")
        );
        assert_eq!(
            expand_path(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let path = temp_key_path("perms");
        save_keypair(&KeyPair::generate(), &path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
