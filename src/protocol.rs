//! Wire protocol: the four JSON message kinds and shared constants.
//!
//! Messages travel as bare JSON objects concatenated on the stream, each
//! discriminated by an `event` field. Field names use the camelCase the
//! protocol fixed on; the Rust side stays snake_case via serde renames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed payload size for file slicing. The last chunk may be shorter.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Default TCP port for transfer connections.
pub const DEFAULT_PORT: u16 = 4000;

/// Well-known UDP port discovery beacons are sent to.
pub const DISCOVERY_PORT: u16 = 57143;

/// Scheme used in connection descriptors (`flick://host:port|name`).
pub const SCHEME: &str = "flick";

/// Socket send/receive buffer size. Sized so a burst of 64 KiB chunks
/// does not stall on kernel backpressure.
pub const SOCKET_BUFFER: usize = 2 * 1024 * 1024;

/// Cap on the framer's accumulation buffer. A single message can never
/// legitimately exceed this (one base64 chunk plus envelope is ~90 KiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

// Centralized timeout constants so both connection roles behave the same.
pub mod timeouts {
    use std::time::Duration;

    /// Bound on a full outbound connection attempt, including the TLS
    /// handshake and the plain-TCP retry.
    pub const CONNECT: Duration = Duration::from_secs(15);

    /// Bound on the client-side TLS handshake alone. A plain-TCP peer
    /// never answers the ClientHello, so without this the fallback would
    /// only start once the whole connect budget was spent.
    pub const TLS_HANDSHAKE: Duration = Duration::from_secs(5);

    /// TCP keep-alive probe time, so a vanished peer is detected even
    /// when no transfer is running.
    pub const KEEPALIVE: Duration = Duration::from_secs(30);

    /// Pacing delay before each chunk-bearing write. Keeps a slow peer's
    /// receive path from being saturated by back-to-back chunks.
    pub const CHUNK_PACING: Duration = Duration::from_millis(10);

    /// Interval between discovery beacons.
    pub const BEACON_INTERVAL: Duration = Duration::from_secs(3);
}

/// Metadata describing one file in flight. Sent once in the offer and
/// kept on both sides for the life of the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
}

impl FileMeta {
    pub fn last_chunk(&self) -> u32 {
        self.total_chunks.saturating_sub(1)
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// One protocol message. The `event` tag on the wire selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Message {
    /// Initiator introduces itself right after the socket opens.
    Connect {
        #[serde(rename = "deviceName")]
        device_name: String,
    },
    /// Sender offers a file; carries the full metadata.
    FileAck { file: FileMeta },
    /// Receiver requests chunk `chunk_no` from the sender.
    SendChunkAck {
        #[serde(rename = "chunkNo")]
        chunk_no: u32,
    },
    /// Sender delivers chunk `chunk_no` as a base64 payload.
    ReceiveChunkAck {
        chunk: String,
        #[serde(rename = "chunkNo")]
        chunk_no: u32,
    },
}

impl Message {
    /// Chunk-bearing traffic is paced; control messages are not.
    pub fn is_chunk_traffic(&self) -> bool {
        matches!(
            self,
            Message::SendChunkAck { .. } | Message::ReceiveChunkAck { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one framed message. Returns `Ok(None)` for a well-formed object
/// whose `event` is not part of the protocol; those are ignored so either
/// side can be extended without breaking the other.
pub fn decode(frame: &[u8]) -> Result<Option<Message>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    match value.get("event").and_then(|e| e.as_str()) {
        Some("connect" | "file_ack" | "send_chunk_ack" | "receive_chunk_ack") => {
            Ok(Some(serde_json::from_value(value)?))
        }
        _ => Ok(None),
    }
}

/// Encode a message as a single JSON object with no trailing delimiter.
pub fn encode(msg: &Message) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Best-effort MIME type from a file name's extension.
pub fn mime_for(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("apk") => "application/vnd.android.package-archive",
        _ => "application/octet-stream",
    }
}
