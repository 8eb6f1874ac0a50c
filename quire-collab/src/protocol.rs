//! Wire protocol for the multiplexed body socket and the share control socket.
//!
//! Binary frame (one per sync message, many paths over one socket):
//! ```text
//! ┌────────────────────┬──────────────────┬─────────────────────────┐
//! │ varUint(path_len)  │ path (UTF-8)     │ payload (DocMessage)    │
//! │ 1..10 bytes, LEB128│ path_len bytes   │ rest of frame           │
//! └────────────────────┴──────────────────┴─────────────────────────┘
//! ```
//!
//! Text frames are JSON objects tagged by `type`: [`ControlMessage`] on the
//! body socket, [`ShareMessage`] on the share control socket.

use serde::{Deserialize, Serialize};

/// Frame key carrying the workspace metadata document.
pub const WORKSPACE_KEY: &str = "@workspace";

/// Frame key prefix for chunked attachment transfer.
pub const BLOB_PREFIX: &str = "@blob/";

/// Append `value` as LEB128: 7 data bits per byte, high bit = more follows.
pub fn write_var_uint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read a LEB128 value, returning it and the number of bytes consumed.
pub fn read_var_uint(bytes: &[u8]) -> Result<(u64, usize), ProtocolError> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 10 {
            break;
        }
        let bits = u64::from(byte & 0x7F);
        let shift = 7 * i as u32;
        if shift == 63 && bits > 1 {
            return Err(ProtocolError::MalformedFrame("varUint overflows u64".into()));
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::MalformedFrame("truncated varUint".into()))
}

/// `varUint(len) ∥ utf8(path) ∥ payload`.
pub fn frame_message(path: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(path.len() + payload.len() + 5);
    write_var_uint(&mut frame, path.len() as u64);
    frame.extend_from_slice(path.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a binary frame into its path and payload.
pub fn unframe_message(frame: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    let (len, header) = read_var_uint(frame)?;
    let len = usize::try_from(len)
        .map_err(|_| ProtocolError::MalformedFrame("path length too large".into()))?;
    let end = header
        .checked_add(len)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "path length {len} exceeds frame of {} bytes",
                frame.len()
            ))
        })?;
    let path = std::str::from_utf8(&frame[header..end])
        .map_err(|_| ProtocolError::MalformedFrame("path is not UTF-8".into()))?;
    Ok((path.to_string(), frame[end..].to_vec()))
}

/// JSON control frames on the multiplexed body socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Server → client: initial sync progress.
    SyncProgress { completed: usize, total: usize },
    /// Server → client: every pending handshake has been answered.
    SyncComplete { files_synced: usize },
    /// Server → client: union of files focused by any peer in the room.
    FocusListChanged { files: Vec<String> },
    /// Client → server.
    Focus { files: Vec<String> },
    /// Client → server.
    Unfocus { files: Vec<String> },
    /// Receiver → sender: outcome of a chunked blob transfer.
    BlobAck { hash: String, ok: bool },
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// JSON frames on the share control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShareMessage {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        join_code: String,
        workspace_id: String,
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        join_code: String,
        workspace_id: String,
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { guest_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { guest_id: String },
    #[serde(rename_all = "camelCase")]
    ReadOnlyChanged { read_only: bool },
    /// Host left; guests should tear down.
    SessionEnded,
    Error { message: String },
    /// Host → server.
    #[serde(rename_all = "camelCase")]
    SetReadOnly { read_only: bool },
}

impl ShareMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Length of each half of a join code.
pub const JOIN_CODE_HALF: usize = 8;

/// Check `^[A-Z0-9]{8}-[A-Z0-9]{8}$` case-insensitively; returns the
/// uppercase form.
pub fn validate_join_code(code: &str) -> Result<String, ProtocolError> {
    let upper = code.trim().to_ascii_uppercase();
    let valid = match upper.split_once('-') {
        Some((a, b)) => [a, b].iter().all(|half| {
            half.len() == JOIN_CODE_HALF
                && half
                    .bytes()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        }),
        None => false,
    };
    if valid {
        Ok(upper)
    } else {
        Err(ProtocolError::InvalidJoinCode(code.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    MalformedFrame(String),
    InvalidJoinCode(String),
    /// Chunk metadata disagrees with earlier chunks of the same transfer.
    InconsistentChunk(String),
    /// Reassembled bytes do not hash to the declared value.
    HashMismatch { expected: String, actual: String },
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::MalformedFrame(e) => write!(f, "Malformed frame: {e}"),
            Self::InvalidJoinCode(code) => write!(f, "Invalid join code: {code:?}"),
            Self::InconsistentChunk(e) => write!(f, "Inconsistent chunk: {e}"),
            Self::HashMismatch { expected, actual } => {
                write!(f, "Hash mismatch: expected {expected}, got {actual}")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
