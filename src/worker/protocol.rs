//! Wire protocol between the controller and the upload worker.
//!
//! Requests flow controller -> worker, callback events flow worker ->
//! controller. No ACKs: a request either reaches the pipe or the link is
//! considered broken.

use crate::error::{Error, Result};
use crate::worker::channel::CallbackEvent;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Maximum frame size (1MB). Status lines and share lists are small.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u32 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    RegisterCallback = 0x02,
    UnregisterCallback = 0x03,
    Pause = 0x04,
    Resume = 0x05,
    StopEverything = 0x06,
    UploadAll = 0x07,
    Share = 0x08,
    SetUploading = 0x10,
    SetFileStatus = 0x11,
    SetByteStatus = 0x12,
    SetDigestRemaining = 0x13,
    SetStatusText = 0x14,
    SetStatsText = 0x15,
    Log = 0x16,
    Fatal = 0x1F,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::RegisterCallback),
            0x03 => Some(Self::UnregisterCallback),
            0x04 => Some(Self::Pause),
            0x05 => Some(Self::Resume),
            0x06 => Some(Self::StopEverything),
            0x07 => Some(Self::UploadAll),
            0x08 => Some(Self::Share),
            0x10 => Some(Self::SetUploading),
            0x11 => Some(Self::SetFileStatus),
            0x12 => Some(Self::SetByteStatus),
            0x13 => Some(Self::SetDigestRemaining),
            0x14 => Some(Self::SetStatusText),
            0x15 => Some(Self::SetStatsText),
            0x16 => Some(Self::Log),
            0x1F => Some(Self::Fatal),
            _ => None,
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

bitflags::bitflags! {
    /// Optional features a worker advertises in its Hello
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u32 {
        const SHARE = 1 << 0;
        const DIGEST_STATUS = 1 << 1;
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 4 {
        return Err(Error::Protocol(format!("{} length missing", what)));
    }
    let len = payload.get_u32() as usize;
    if payload.remaining() < len {
        return Err(Error::Protocol(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| Error::Protocol(format!("Invalid UTF-8 in {}", what)))
}

fn need(payload: &Bytes, len: usize, what: &str) -> Result<()> {
    if payload.remaining() < len {
        return Err(Error::Protocol(format!("{} payload too short", what)));
    }
    Ok(())
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub capabilities: Capabilities,
}

impl Hello {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            capabilities,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u16(self.version);
        payload.put_u32(self.capabilities.bits());
        frame(MessageType::Hello, &payload)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        need(&payload, 6, "Hello")?;
        Ok(Self {
            version: payload.get_u16(),
            capabilities: Capabilities::from_bits_truncate(payload.get_u32()),
        })
    }
}

// =============================================================================
// Requests (controller -> worker)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    RegisterCallback,
    UnregisterCallback,
    Pause,
    Resume,
    StopEverything,
    UploadAll,
    /// Content shared from elsewhere, to be uploaded
    Share(Vec<String>),
}

impl WorkerRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            WorkerRequest::RegisterCallback => MessageType::RegisterCallback,
            WorkerRequest::UnregisterCallback => MessageType::UnregisterCallback,
            WorkerRequest::Pause => MessageType::Pause,
            WorkerRequest::Resume => MessageType::Resume,
            WorkerRequest::StopEverything => MessageType::StopEverything,
            WorkerRequest::UploadAll => MessageType::UploadAll,
            WorkerRequest::Share(_) => MessageType::Share,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            WorkerRequest::Share(paths) => {
                let mut payload = BytesMut::new();
                payload.put_u32(paths.len() as u32);
                for path in paths {
                    put_string(&mut payload, path);
                }
                frame(MessageType::Share, &payload)
            }
            other => frame(other.message_type(), &[]),
        }
    }

    pub fn decode(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        match msg_type {
            MessageType::RegisterCallback => Ok(Self::RegisterCallback),
            MessageType::UnregisterCallback => Ok(Self::UnregisterCallback),
            MessageType::Pause => Ok(Self::Pause),
            MessageType::Resume => Ok(Self::Resume),
            MessageType::StopEverything => Ok(Self::StopEverything),
            MessageType::UploadAll => Ok(Self::UploadAll),
            MessageType::Share => {
                need(&payload, 4, "Share")?;
                let count = payload.get_u32() as usize;
                let mut paths = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    paths.push(get_string(&mut payload, "Share path")?);
                }
                Ok(Self::Share(paths))
            }
            other => Err(Error::Protocol(format!(
                "{:?} is not a worker request",
                other
            ))),
        }
    }
}

// =============================================================================
// Events (worker -> controller)
// =============================================================================

/// Encode a callback event as a frame.
pub fn encode_event(event: &CallbackEvent) -> Bytes {
    let mut payload = BytesMut::new();
    let msg_type = match event {
        CallbackEvent::SetUploading(uploading) => {
            payload.put_u8(u8::from(*uploading));
            MessageType::SetUploading
        }
        CallbackEvent::SetFileStatus {
            done,
            in_flight,
            total,
        } => {
            payload.put_u32(*done);
            payload.put_u32(*in_flight);
            payload.put_u32(*total);
            MessageType::SetFileStatus
        }
        CallbackEvent::SetByteStatus {
            done,
            in_flight,
            total,
        } => {
            payload.put_u64(*done);
            payload.put_u64(*in_flight);
            payload.put_u64(*total);
            MessageType::SetByteStatus
        }
        CallbackEvent::SetDigestRemaining(remaining) => {
            payload.put_u32(*remaining);
            MessageType::SetDigestRemaining
        }
        CallbackEvent::SetStatusText(text) => {
            put_string(&mut payload, text);
            MessageType::SetStatusText
        }
        CallbackEvent::SetStatsText(text) => {
            put_string(&mut payload, text);
            MessageType::SetStatsText
        }
        CallbackEvent::Log(line) => {
            put_string(&mut payload, line);
            MessageType::Log
        }
    };
    frame(msg_type, &payload)
}

/// Encode a fatal error; the worker closes the stream after sending it.
pub fn encode_fatal(message: &str) -> Bytes {
    let mut payload = BytesMut::new();
    put_string(&mut payload, message);
    frame(MessageType::Fatal, &payload)
}

/// Anything the worker may send after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Hello(Hello),
    Event(CallbackEvent),
    Fatal(String),
}

pub fn decode_inbound(msg_type: MessageType, mut payload: Bytes) -> Result<Inbound> {
    let event = match msg_type {
        MessageType::Hello => return Hello::decode(payload).map(Inbound::Hello),
        MessageType::Fatal => {
            return get_string(&mut payload, "Fatal message").map(Inbound::Fatal);
        }
        MessageType::SetUploading => {
            need(&payload, 1, "SetUploading")?;
            CallbackEvent::SetUploading(payload.get_u8() != 0)
        }
        MessageType::SetFileStatus => {
            need(&payload, 12, "SetFileStatus")?;
            CallbackEvent::SetFileStatus {
                done: payload.get_u32(),
                in_flight: payload.get_u32(),
                total: payload.get_u32(),
            }
        }
        MessageType::SetByteStatus => {
            need(&payload, 24, "SetByteStatus")?;
            CallbackEvent::SetByteStatus {
                done: payload.get_u64(),
                in_flight: payload.get_u64(),
                total: payload.get_u64(),
            }
        }
        MessageType::SetDigestRemaining => {
            need(&payload, 4, "SetDigestRemaining")?;
            CallbackEvent::SetDigestRemaining(payload.get_u32())
        }
        MessageType::SetStatusText => {
            CallbackEvent::SetStatusText(get_string(&mut payload, "status text")?)
        }
        MessageType::SetStatsText => {
            CallbackEvent::SetStatsText(get_string(&mut payload, "stats text")?)
        }
        MessageType::Log => CallbackEvent::Log(get_string(&mut payload, "log line")?),
        other => {
            return Err(Error::Protocol(format!(
                "Unexpected {:?} from worker",
                other
            )))
        }
    };
    Ok(Inbound::Event(event))
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| Error::Protocol(format!("Unknown message type 0x{:02x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Worker speaks an older protocol
    TooOld { peer: u16, min_supported: u16 },
    /// Worker speaks a newer protocol
    TooNew { peer: u16, max_supported: u16 },
}

/// Check if a peer's protocol version is supported.
pub fn negotiate_version(peer_version: u16) -> VersionNegotiationResult {
    if peer_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            peer: peer_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if peer_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            peer: peer_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(peer_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
