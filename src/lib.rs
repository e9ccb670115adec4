//! Veilgate
//!
//! A decentralized, privacy-preserving gateway that fronts AI inference
//! backends with an OpenAI-compatible HTTP interface. Three roles share
//! this workspace:
//!
//! - **Client** ([`client`]): local proxy encrypting requests end-to-end
//! - **Relay** ([`relay`]): forwards ciphertext routed by exit key hash,
//!   unable to read any of it
//! - **Exit** ([`exit`]): holds the decryption keys and speaks to the AI
//!   backend, reachable only through its reverse tunnel
//!
//! This facade crate re-exports the workspace members under one roof and
//! hosts the end-to-end integration tests.

pub use veilgate_client as client;
pub use veilgate_core as core;
pub use veilgate_crypto as crypto;
pub use veilgate_exit as exit;
pub use veilgate_keystore as keystore;
pub use veilgate_logging as logging;
pub use veilgate_protocol as protocol;
pub use veilgate_relay as relay;
