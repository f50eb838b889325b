//! Wire envelope and typed messages shared by broker and client.
//!
//! Every framed unit on either channel is:
//!
//! ```text
//! offset
//!    0  ┐
//!    1  │ kind (u32, big-endian): 0 = Text, 1 = File, 2 = SendHistory
//!    2  │
//!    3  ┘
//!    4  ┐
//!    :  │ payload_len (u64, big-endian)
//!   11  ┘
//! ------
//!    payload (payload_len bytes)
//! ```
//!
//! Payload grammars per kind:
//!
//! - `Text`: UTF-8 bytes, `payload_len` of them.
//! - `File`: `name_len (u64 BE) | data_len (u64 BE) | name | data`, with
//!   `16 + name_len + data_len == payload_len`.
//! - `SendHistory`: a single u32 carrying the requester's file-channel
//!   remote port in its low 16 bits; `payload_len == 4`.
//!
//! The payload length field is authoritative: neither side ever derives a
//! message boundary from socket closure.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Envelope header size: kind (4) + payload_len (8).
pub const HEADER_LEN: usize = 12;

/// Fixed portion of a File payload: name_len (8) + data_len (8).
const FILE_FIXED_LEN: u64 = 16;

/// Default reject-limit for a single envelope.
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Closed set of message kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Text = 0,
    File = 1,
    SendHistory = 2,
}

impl MessageKind {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MessageKind::Text),
            1 => Some(MessageKind::File),
            2 => Some(MessageKind::SendHistory),
            _ => None,
        }
    }

    pub fn as_wire(self) -> u32 {
        self as u32
    }
}

/// A named blob of file bytes as carried in a `File` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMessage {
    pub name: String,
    pub data: Vec<u8>,
}

impl FileMessage {
    /// Reads a file from disk, keeping only the final path component as the
    /// transferred name.
    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no usable file name")
            })?;
        let data = tokio::fs::read(path).await?;
        Ok(Self { name, data })
    }

    /// Serializes this file as a complete `File` envelope.
    ///
    /// Lives on `FileMessage` so senders holding a shared file (fan-out,
    /// history replay) can frame it without cloning the payload into a
    /// [`Message`] first.
    pub fn encode(&self) -> Bytes {
        let payload_len = FILE_FIXED_LEN + self.name.len() as u64 + self.data.len() as u64;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len as usize);
        buf.put_u32(MessageKind::File.as_wire());
        buf.put_u64(payload_len);
        buf.put_u64(self.name.len() as u64);
        buf.put_u64(self.data.len() as u64);
        buf.put_slice(self.name.as_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Writes the received bytes into `dir`, creating it if needed.
    ///
    /// The stored name is reduced to its final path component so a peer
    /// cannot steer the write outside the save directory.
    pub async fn save_under(&self, dir: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let name = Path::new(&self.name)
            .file_name()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "received_file.bin".as_ref());
        let target = dir.join(name);
        tokio::fs::write(&target, &self.data).await?;
        Ok(target)
    }
}

impl fmt::Display for FileMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileMessage: {} ({} bytes)", self.name, self.data.len())
    }
}

/// A decoded message from either channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    File(FileMessage),
    /// Request for a history replay; carries the requester's file-channel
    /// remote port so the broker can pair its two channels.
    SendHistory { file_port: u16 },
}

/// A structurally valid frame whose body does not match its kind's grammar.
///
/// These are non-fatal to the connection: the frame is dropped and the next
/// header read is armed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("text payload is not valid UTF-8")]
    Utf8,
    #[error("file payload lengths disagree with the envelope")]
    FileLayout,
    #[error("send-history payload must be exactly 4 bytes, got {0}")]
    HistoryLayout(usize),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::File(_) => MessageKind::File,
            Message::SendHistory { .. } => MessageKind::SendHistory,
        }
    }

    /// Serializes the full envelope (header + payload) into one contiguous
    /// buffer, ready for a single whole-buffer write.
    pub fn encode(&self) -> Bytes {
        match self {
            Message::Text(text) => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + text.len());
                buf.put_u32(MessageKind::Text.as_wire());
                buf.put_u64(text.len() as u64);
                buf.put_slice(text.as_bytes());
                buf.freeze()
            }
            Message::File(file) => file.encode(),
            Message::SendHistory { file_port } => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + 4);
                buf.put_u32(MessageKind::SendHistory.as_wire());
                buf.put_u64(4);
                // Ports are 16-bit but travel in a u32 container to keep the
                // payload 32-bit aligned.
                buf.put_u32(u32::from(*file_port));
                buf.freeze()
            }
        }
    }

    /// Constructs the concrete variant for an already-read frame body.
    pub fn decode(kind: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        let kind = MessageKind::from_wire(kind).ok_or(DecodeError::UnknownKind(kind))?;
        match kind {
            MessageKind::Text => {
                let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Utf8)?;
                Ok(Message::Text(text.to_owned()))
            }
            MessageKind::File => {
                if (payload.len() as u64) < FILE_FIXED_LEN {
                    return Err(DecodeError::FileLayout);
                }
                let mut buf = payload;
                let name_len = buf.get_u64();
                let data_len = buf.get_u64();
                let expected = name_len
                    .checked_add(data_len)
                    .and_then(|n| n.checked_add(FILE_FIXED_LEN))
                    .ok_or(DecodeError::FileLayout)?;
                if expected != payload.len() as u64 {
                    return Err(DecodeError::FileLayout);
                }
                let name = std::str::from_utf8(&buf[..name_len as usize])
                    .map_err(|_| DecodeError::Utf8)?
                    .to_owned();
                buf.advance(name_len as usize);
                Ok(Message::File(FileMessage {
                    name,
                    data: buf.to_vec(),
                }))
            }
            MessageKind::SendHistory => {
                if payload.len() != 4 {
                    return Err(DecodeError::HistoryLayout(payload.len()));
                }
                let mut buf = payload;
                let container = buf.get_u32();
                Ok(Message::SendHistory {
                    file_port: container as u16,
                })
            }
        }
    }
}
