//! Wire protocol types, framing and serialization for SquirrelDB.
//!
//! The TCP wire protocol opens with a handshake:
//!
//! ```text
//! client -> MAGIC | version:u8 | flags:u8 | token_len:u16 BE | token
//! server -> status:u8 | version:u8 | flags:u8 | session_id:16 bytes
//! ```
//!
//! After a successful handshake both sides exchange length-prefixed frames:
//!
//! ```text
//! length:u32 BE | msg_type:u8 | encoding:u8 | payload
//! ```
//!
//! where `length` counts the type byte, the encoding byte and the payload.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Protocol magic bytes
pub const MAGIC: &[u8; 4] = b"SQRL";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the fixed-length handshake response.
pub const HANDSHAKE_RESPONSE_LEN: usize = 19;

/// Size of a frame header.
pub const FRAME_HEADER_LEN: usize = 6;

/// Handshake status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeStatus {
  Success = 0x00,
  VersionMismatch = 0x01,
  AuthFailed = 0x02,
}

impl TryFrom<u8> for HandshakeStatus {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, ()> {
    match v {
      0x00 => Ok(Self::Success),
      0x01 => Ok(Self::VersionMismatch),
      0x02 => Ok(Self::AuthFailed),
      _ => Err(()),
    }
  }
}

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageType {
  Request = 0x01,
  Response = 0x02,
  Notification = 0x03,
}

impl TryFrom<u8> for MessageType {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, ()> {
    match v {
      0x01 => Ok(Self::Request),
      0x02 => Ok(Self::Response),
      0x03 => Ok(Self::Notification),
      _ => Err(()),
    }
  }
}

/// Encoding formats
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Encoding {
  #[default]
  MessagePack = 0x01,
  Json = 0x02,
}

impl TryFrom<u8> for Encoding {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, ()> {
    match v {
      0x01 => Ok(Self::MessagePack),
      0x02 => Ok(Self::Json),
      _ => Err(()),
    }
  }
}

/// Protocol flags in handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolFlags {
  pub messagepack: bool,
  pub json_fallback: bool,
}

impl From<u8> for ProtocolFlags {
  fn from(byte: u8) -> Self {
    Self {
      messagepack: byte & 0x01 != 0,
      json_fallback: byte & 0x02 != 0,
    }
  }
}

impl From<ProtocolFlags> for u8 {
  fn from(flags: ProtocolFlags) -> u8 {
    let mut byte = 0u8;
    if flags.messagepack {
      byte |= 0x01;
    }
    if flags.json_fallback {
      byte |= 0x02;
    }
    byte
  }
}

/// Parsed server handshake response.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeReply {
  pub status: HandshakeStatus,
  pub version: u8,
  pub flags: ProtocolFlags,
  pub session_id: Uuid,
}

/// Build the handshake packet sent to the server.
pub fn build_handshake(auth_token: &str, flags: ProtocolFlags) -> Vec<u8> {
  let token = auth_token.as_bytes();
  let mut buf = Vec::with_capacity(MAGIC.len() + 4 + token.len());
  buf.extend_from_slice(MAGIC);
  buf.push(PROTOCOL_VERSION);
  buf.push(flags.into());
  buf.extend_from_slice(&(token.len() as u16).to_be_bytes());
  buf.extend_from_slice(token);
  buf
}

/// Parse the fixed-length handshake response from the server.
pub fn parse_handshake_response(data: &[u8]) -> Result<HandshakeReply> {
  if data.len() < HANDSHAKE_RESPONSE_LEN {
    return Err(Error::Handshake(format!(
      "response too short: {} bytes",
      data.len()
    )));
  }

  let status = HandshakeStatus::try_from(data[0])
    .map_err(|_| Error::Handshake(format!("unknown status: 0x{:02x}", data[0])))?;
  let version = data[1];
  let flags = ProtocolFlags::from(data[2]);
  let session_id = Uuid::from_slice(&data[3..19])
    .map_err(|e| Error::Handshake(format!("invalid session id: {}", e)))?;

  Ok(HandshakeReply {
    status,
    version,
    flags,
    session_id,
  })
}

/// Encode a message payload in the given encoding.
pub fn encode_message<T: Serialize>(msg: &T, encoding: Encoding) -> Result<Vec<u8>> {
  match encoding {
    Encoding::MessagePack => Ok(rmp_serde::to_vec_named(msg)?),
    Encoding::Json => Ok(serde_json::to_vec(msg)?),
  }
}

/// Decode a message payload in the given encoding.
pub fn decode_message<T: DeserializeOwned>(data: &[u8], encoding: Encoding) -> Result<T> {
  match encoding {
    Encoding::MessagePack => Ok(rmp_serde::from_slice(data)?),
    Encoding::Json => Ok(serde_json::from_slice(data)?),
  }
}

/// Frame an encoded payload for the wire.
pub fn build_frame(msg_type: MessageType, encoding: Encoding, payload: &[u8]) -> Vec<u8> {
  // Length covers the type and encoding bytes.
  let length = (payload.len() + 2) as u32;
  let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
  buf.extend_from_slice(&length.to_be_bytes());
  buf.push(msg_type as u8);
  buf.push(encoding as u8);
  buf.extend_from_slice(payload);
  buf
}

/// Parse a frame header, returning the payload length still to be read.
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(usize, MessageType, Encoding)> {
  let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
  if length < 2 {
    return Err(Error::Serialization(format!("frame too short: {}", length)));
  }
  if length > MAX_MESSAGE_SIZE {
    return Err(Error::Serialization(format!("message too large: {}", length)));
  }

  let msg_type = MessageType::try_from(header[4])
    .map_err(|_| Error::Serialization(format!("unknown message type: 0x{:02x}", header[4])))?;
  let encoding = Encoding::try_from(header[5])
    .map_err(|_| Error::Serialization(format!("unknown encoding: 0x{:02x}", header[5])))?;

  Ok(((length - 2) as usize, msg_type, encoding))
}

/// Client-to-server message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
  Query {
    id: String,
    query: String,
  },
  Subscribe {
    id: String,
    query: String,
  },
  Unsubscribe {
    id: String,
  },
  Insert {
    id: String,
    collection: String,
    data: serde_json::Value,
  },
  Update {
    id: String,
    collection: String,
    document_id: Uuid,
    data: serde_json::Value,
  },
  Delete {
    id: String,
    collection: String,
    document_id: Uuid,
  },
  ListCollections {
    id: String,
  },
  Ping {
    id: String,
  },
}

impl ClientMessage {
  /// The request id used to correlate the server's response.
  pub fn request_id(&self) -> &str {
    match self {
      Self::Query { id, .. }
      | Self::Subscribe { id, .. }
      | Self::Unsubscribe { id }
      | Self::Insert { id, .. }
      | Self::Update { id, .. }
      | Self::Delete { id, .. }
      | Self::ListCollections { id }
      | Self::Ping { id } => id,
    }
  }
}

/// Server-to-client message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
  Result { id: String, data: serde_json::Value },
  Change { id: String, change: ChangeEvent },
  Subscribed { id: String },
  Unsubscribed { id: String },
  Error { id: String, error: String },
  Pong { id: String },
}

impl ServerMessage {
  /// The request or subscription id this message correlates to.
  pub fn request_id(&self) -> &str {
    match self {
      Self::Result { id, .. }
      | Self::Change { id, .. }
      | Self::Subscribed { id }
      | Self::Unsubscribed { id }
      | Self::Error { id, .. }
      | Self::Pong { id } => id,
    }
  }
}

/// Change event types for subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
  Initial { document: Document },
  Insert { new: Document },
  Update { old: serde_json::Value, new: Document },
  Delete { old: Document },
}

/// Document structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
  pub id: Uuid,
  pub collection: String,
  pub data: serde_json::Value,
  pub created_at: String,
  pub updated_at: String,
}
