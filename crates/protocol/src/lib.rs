//! Veilgate wire protocol
//!
//! One record format carries every message over any QUIC stream:
//!
//! `Type(1) || TargetLen(2, BE) || Target || PayloadLen(4, BE) || Payload`
//!
//! Target is present only on messages that carry a routing key (Request,
//! StreamRequest, Register) and is empty on the wire for all others. Size
//! caps are validated before any allocation. Partial reads are retried by
//! the underlying `read_exact`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// ALPN announcing a client-facing connection.
pub const RELAY_ALPN: &[u8] = b"veilgate-relay";
/// ALPN announcing an exit reverse-tunnel connection.
pub const EXIT_ALPN: &[u8] = b"veilgate-exit";

/// Target cap: 1 KiB.
pub const MAX_TARGET_SIZE: usize = 1024;
/// Payload cap: 16 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("target too long: {0} > {MAX_TARGET_SIZE}")]
    TargetTooLong(usize),

    #[error("payload too large: {0} > {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    #[error("target is not valid utf-8")]
    InvalidTarget,

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// One wire message. The discriminant is the on-wire type byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// OHTTP-encapsulated request; target is the exit pubKeyHash on the
    /// client→relay hop, empty on the relay→exit hop.
    Request { target: String, payload: Vec<u8> },
    /// OHTTP-encapsulated response.
    Response { payload: Vec<u8> },
    /// Same shape as Request; signals an SSE response is expected.
    StreamRequest { target: String, payload: Vec<u8> },
    /// One encrypted SSE event.
    StreamChunk { payload: Vec<u8> },
    /// Terminates a stream.
    StreamEnd,
    /// Exit→relay registration; target is the exit pubKeyHash.
    Register { target: String, key_config: Vec<u8> },
    RegisterAck,
    QueryExitKeys,
    /// JSON array of [`ExitKeyEntry`].
    ExitKeysResponse { payload: Vec<u8> },
    Heartbeat,
    HeartbeatAck,
    /// Short, generic error description.
    Error { message: String },
}

impl Message {
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Request { .. } => 0x01,
            Message::Response { .. } => 0x02,
            Message::StreamRequest { .. } => 0x03,
            Message::StreamChunk { .. } => 0x04,
            Message::StreamEnd => 0x05,
            Message::Register { .. } => 0x10,
            Message::RegisterAck => 0x11,
            Message::QueryExitKeys => 0x12,
            Message::ExitKeysResponse { .. } => 0x13,
            Message::Heartbeat => 0x20,
            Message::HeartbeatAck => 0x21,
            Message::Error { .. } => 0xFF,
        }
    }

    fn target(&self) -> &str {
        match self {
            Message::Request { target, .. }
            | Message::StreamRequest { target, .. }
            | Message::Register { target, .. } => target,
            _ => "",
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Message::Request { payload, .. }
            | Message::Response { payload }
            | Message::StreamRequest { payload, .. }
            | Message::StreamChunk { payload }
            | Message::ExitKeysResponse { payload } => payload,
            Message::Register { key_config, .. } => key_config,
            Message::Error { message } => message.as_bytes(),
            _ => &[],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let target = self.target().as_bytes();
        let payload = self.payload();
        let mut buf = Vec::with_capacity(1 + 2 + target.len() + 4 + payload.len());
        buf.push(self.type_byte());
        buf.extend_from_slice(&(target.len() as u16).to_be_bytes());
        buf.extend_from_slice(target);
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn from_parts(type_byte: u8, target: String, payload: Vec<u8>) -> Result<Self> {
        Ok(match type_byte {
            0x01 => Message::Request { target, payload },
            0x02 => Message::Response { payload },
            0x03 => Message::StreamRequest { target, payload },
            0x04 => Message::StreamChunk { payload },
            0x05 => Message::StreamEnd,
            0x10 => Message::Register {
                target,
                key_config: payload,
            },
            0x11 => Message::RegisterAck,
            0x12 => Message::QueryExitKeys,
            0x13 => Message::ExitKeysResponse { payload },
            0x20 => Message::Heartbeat,
            0x21 => Message::HeartbeatAck,
            0xFF => Message::Error {
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// Read one framed message, validating size caps before allocating.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; 3];
    reader.read_exact(&mut header).await?;
    let type_byte = header[0];
    let target_len = u16::from_be_bytes([header[1], header[2]]) as usize;
    if target_len > MAX_TARGET_SIZE {
        return Err(ProtocolError::TargetTooLong(target_len));
    }

    let mut target = vec![0u8; target_len];
    if target_len > 0 {
        reader.read_exact(&mut target).await?;
    }
    let target = String::from_utf8(target).map_err(|_| ProtocolError::InvalidTarget)?;

    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Message::from_parts(type_byte, target, payload)
}

/// Write one framed message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(&msg.encode()).await?;
    Ok(())
}

/// One entry of an ExitKeysResponse payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitKeyEntry {
    pub pub_key_hash: String,
    #[serde(with = "base64_bytes")]
    pub key_config: Vec<u8>,
}

pub fn encode_exit_keys(entries: &[ExitKeyEntry]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(entries)?)
}

pub fn decode_exit_keys(payload: &[u8]) -> Result<Vec<ExitKeyEntry>> {
    Ok(serde_json::from_slice(payload)?)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
