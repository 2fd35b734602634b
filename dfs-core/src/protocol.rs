//! Client/node wire protocol
//!
//! Every message travels in one envelope:
//!
//! ```text
//! +---------+-----------------+----------------------+
//! | tag (1) | length (4, BE)  | body (length bytes)  |
//! +---------+-----------------+----------------------+
//! ```
//!
//! Body fields:
//! - text: `u16` BE length followed by UTF-8 bytes
//! - part index: `u8` in `1..=4`
//! - payload: `u64` BE part size followed by exactly that many bytes, always
//!   the last field of a body
//!
//! Sequences:
//! - `list` / `get`: client sends `Request`, node answers zero or more
//!   `Entry` frames then `Done`
//! - `put`: client sends `Request` then two `Upload` frames, node answers
//!   `Ack`
//!
//! Any deviation is a [`ProtocolError`]. The length is checked against the
//! largest body the tag can carry under [`FrameLimits`] before anything is
//! allocated.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::fragmenter::PartIndex;

/// Size of the envelope header (tag + length)
pub const HEADER_LEN: usize = 5;

/// Default limit on text fields (the reference frame width)
pub const DEFAULT_MAX_FIELD_LEN: usize = 1024;

/// Default limit on a single fragment payload (256 MiB)
pub const DEFAULT_MAX_PAYLOAD_LEN: u64 = 256 * 1024 * 1024;

/// Largest body the u32 length field can describe
pub const MAX_BODY_LEN: u64 = u32::MAX as u64;

// Entry carries the most around its payload: text + part + size
const ENTRY_OVERHEAD: u64 = 2 + u16::MAX as u64 + 1 + 8;

/// Largest payload limit that still fits every frame in the length field
pub const MAX_PAYLOAD_LIMIT: u64 = MAX_BODY_LEN - ENTRY_OVERHEAD;

const TAG_REQUEST: u8 = 1;
const TAG_ENTRY: u8 = 2;
const TAG_DONE: u8 = 3;
const TAG_UPLOAD: u8 = 4;
const TAG_ACK: u8 = 5;
const TAG_ERROR: u8 = 6;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed before a frame arrived")]
    Closed,

    #[error("Connection closed in the middle of a frame")]
    Truncated,

    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Frame length {len} exceeds limit {max}")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("Field length {len} exceeds limit {max}")]
    FieldTooLong { len: usize, max: usize },

    #[error("Frame body too short: need {needed} bytes, {available} left")]
    ShortBody { needed: usize, available: usize },

    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),

    #[error("Text field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid part index: {0}")]
    InvalidPartIndex(u8),

    #[error("Declared part size {declared} does not match payload length {actual}")]
    SizeMismatch { declared: u64, actual: usize },

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Missing filename for {0} request")]
    MissingFilename(Command),

    #[error("Expected {expected} frame, got {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Remote error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Size limits enforced on both encode and decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameLimits {
    pub max_field_len: usize,
    pub max_payload_len: u64,
}

impl FrameLimits {
    fn field_len(&self) -> u64 {
        2 + self.max_field_len.min(u16::MAX as usize) as u64
    }

    /// Largest body a frame with `tag` can have under these limits
    pub fn max_body_len(&self, tag: u8) -> Option<u64> {
        let field = self.field_len();
        let max = match tag {
            TAG_REQUEST => 3 * field,
            TAG_ENTRY => (field + 1 + 8).saturating_add(self.max_payload_len),
            TAG_DONE => 0,
            TAG_UPLOAD => (1 + 8u64).saturating_add(self.max_payload_len),
            TAG_ACK => 1,
            TAG_ERROR => field,
            _ => return None,
        };
        Some(max.min(MAX_BODY_LEN))
    }

    /// Reject limits whose frames could not be described by the envelope
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_payload_len > MAX_PAYLOAD_LIMIT {
            return Err(format!(
                "max_payload_len {} exceeds {}",
                self.max_payload_len, MAX_PAYLOAD_LIMIT
            ));
        }
        if self.max_field_len > u16::MAX as usize {
            return Err(format!(
                "max_field_len {} exceeds {}",
                self.max_field_len,
                u16::MAX
            ));
        }
        Ok(())
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_field_len: DEFAULT_MAX_FIELD_LEN,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}

/// Operation requested from every node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    List,
    Get,
    Put,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::List => "list",
            Command::Get => "get",
            Command::Put => "put",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "list" => Ok(Command::List),
            "get" => Ok(Command::Get),
            "put" => Ok(Command::Put),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Request header, sent once per command to every node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// `None` for `list`; encoded as an empty text field
    pub filename: Option<String>,
    pub username: String,
}

/// One stored fragment announced by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub filename: String,
    pub part: PartIndex,
    pub payload: Bytes,
}

/// One fragment pushed to a node during `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub part: PartIndex,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    Entry(Entry),
    Done,
    Upload(Upload),
    /// Number of fragments the node persisted
    Ack(u8),
    Error(String),
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Request(_) => TAG_REQUEST,
            Frame::Entry(_) => TAG_ENTRY,
            Frame::Done => TAG_DONE,
            Frame::Upload(_) => TAG_UPLOAD,
            Frame::Ack(_) => TAG_ACK,
            Frame::Error(_) => TAG_ERROR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Request(_) => "Request",
            Frame::Entry(_) => "Entry",
            Frame::Done => "Done",
            Frame::Upload(_) => "Upload",
            Frame::Ack(_) => "Ack",
            Frame::Error(_) => "Error",
        }
    }

    /// Serialize the frame, envelope included
    pub fn encode(&self, limits: &FrameLimits) -> Result<Bytes> {
        let mut body = BytesMut::new();

        match self {
            Frame::Request(request) => {
                put_text(&mut body, request.command.as_str(), limits)?;
                put_text(&mut body, request.filename.as_deref().unwrap_or(""), limits)?;
                put_text(&mut body, &request.username, limits)?;
            }
            Frame::Entry(entry) => {
                put_text(&mut body, &entry.filename, limits)?;
                body.put_u8(entry.part.get());
                put_payload(&mut body, &entry.payload, limits)?;
            }
            Frame::Done => {}
            Frame::Upload(upload) => {
                body.put_u8(upload.part.get());
                put_payload(&mut body, &upload.payload, limits)?;
            }
            Frame::Ack(count) => body.put_u8(*count),
            Frame::Error(message) => {
                let mut cut = message.len().min(limits.max_field_len);
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                put_text(&mut body, &message[..cut], limits)?;
            }
        }

        let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            len: body.len() as u64,
            max: MAX_BODY_LEN,
        })?;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_u8(self.tag());
        frame.put_u32(len);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Parse a frame body for the given tag
    pub fn decode(tag: u8, mut body: Bytes, limits: &FrameLimits) -> Result<Self> {
        let frame = match tag {
            TAG_REQUEST => {
                let command = take_text(&mut body, limits)?.parse::<Command>()?;
                let filename = take_text(&mut body, limits)?;
                let username = take_text(&mut body, limits)?;
                Frame::Request(Request {
                    command,
                    filename: (!filename.is_empty()).then_some(filename),
                    username,
                })
            }
            TAG_ENTRY => {
                let filename = take_text(&mut body, limits)?;
                let part = take_part(&mut body)?;
                let payload = take_payload(&mut body, limits)?;
                Frame::Entry(Entry {
                    filename,
                    part,
                    payload,
                })
            }
            TAG_DONE => Frame::Done,
            TAG_UPLOAD => {
                let part = take_part(&mut body)?;
                let payload = take_payload(&mut body, limits)?;
                Frame::Upload(Upload { part, payload })
            }
            TAG_ACK => Frame::Ack(take_u8(&mut body)?),
            TAG_ERROR => Frame::Error(take_text(&mut body, limits)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        if body.has_remaining() {
            return Err(ProtocolError::TrailingBytes(body.remaining()));
        }
        Ok(frame)
    }
}

fn put_text(buf: &mut BytesMut, text: &str, limits: &FrameLimits) -> Result<()> {
    let max = limits.max_field_len.min(u16::MAX as usize);
    if text.len() > max {
        return Err(ProtocolError::FieldTooLong {
            len: text.len(),
            max,
        });
    }
    buf.put_u16(text.len() as u16);
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

fn put_payload(buf: &mut BytesMut, payload: &[u8], limits: &FrameLimits) -> Result<()> {
    if payload.len() as u64 > limits.max_payload_len {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len() as u64,
            max: limits.max_payload_len,
        });
    }
    buf.put_u64(payload.len() as u64);
    buf.extend_from_slice(payload);
    Ok(())
}

fn ensure(body: &Bytes, needed: usize) -> Result<()> {
    if body.remaining() < needed {
        return Err(ProtocolError::ShortBody {
            needed,
            available: body.remaining(),
        });
    }
    Ok(())
}

fn take_u8(body: &mut Bytes) -> Result<u8> {
    ensure(body, 1)?;
    Ok(body.get_u8())
}

fn take_part(body: &mut Bytes) -> Result<PartIndex> {
    let raw = take_u8(body)?;
    PartIndex::new(raw).ok_or(ProtocolError::InvalidPartIndex(raw))
}

fn take_text(body: &mut Bytes, limits: &FrameLimits) -> Result<String> {
    ensure(body, 2)?;
    let len = body.get_u16() as usize;
    if len > limits.max_field_len {
        return Err(ProtocolError::FieldTooLong {
            len,
            max: limits.max_field_len,
        });
    }
    ensure(body, len)?;
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn take_payload(body: &mut Bytes, limits: &FrameLimits) -> Result<Bytes> {
    ensure(body, 8)?;
    let declared = body.get_u64();
    if declared > limits.max_payload_len {
        return Err(ProtocolError::FrameTooLarge {
            len: declared,
            max: limits.max_payload_len,
        });
    }
    if body.remaining() as u64 != declared {
        return Err(ProtocolError::SizeMismatch {
            declared,
            actual: body.remaining(),
        });
    }
    Ok(body.split_to(declared as usize))
}

fn eof_is_truncation(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(err)
    }
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame, limits: &FrameLimits) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode(limits)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read exactly one frame
///
/// Returns [`ProtocolError::Closed`] if the peer closed cleanly between
/// frames and [`ProtocolError::Truncated`] if it closed inside one.
pub async fn read_frame<R>(reader: &mut R, limits: &FrameLimits) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let tag = match reader.read_u8().await {
        Ok(tag) => tag,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(ProtocolError::Closed),
        Err(e) => return Err(e.into()),
    };
    let max = limits
        .max_body_len(tag)
        .ok_or(ProtocolError::UnknownTag(tag))?;

    let len = reader.read_u32().await.map_err(eof_is_truncation)? as u64;
    if len > max {
        return Err(ProtocolError::FrameTooLarge { len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(eof_is_truncation)?;

    Frame::decode(tag, Bytes::from(body), limits)
}

fn unexpected(expected: &'static str, frame: Frame) -> ProtocolError {
    match frame {
        Frame::Error(message) => ProtocolError::Remote(message),
        other => ProtocolError::UnexpectedFrame {
            expected,
            actual: other.name(),
        },
    }
}

/// A framed, ordered stream to one peer
pub struct Connection<S> {
    stream: S,
    limits: FrameLimits,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: FrameLimits) -> Self {
        Self { stream, limits }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        write_frame(&mut self.stream, frame, &self.limits).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Frame> {
        read_frame(&mut self.stream, &self.limits).await
    }

    pub async fn recv_request(&mut self) -> Result<Request> {
        match self.recv().await? {
            Frame::Request(request) => Ok(request),
            other => Err(unexpected("Request", other)),
        }
    }

    pub async fn recv_upload(&mut self) -> Result<Upload> {
        match self.recv().await? {
            Frame::Upload(upload) => Ok(upload),
            other => Err(unexpected("Upload", other)),
        }
    }

    /// Next directory entry, or `None` once the node sent `Done`
    pub async fn recv_entry(&mut self) -> Result<Option<Entry>> {
        match self.recv().await? {
            Frame::Entry(entry) => Ok(Some(entry)),
            Frame::Done => Ok(None),
            other => Err(unexpected("Entry or Done", other)),
        }
    }

    pub async fn recv_ack(&mut self) -> Result<u8> {
        match self.recv().await? {
            Frame::Ack(count) => Ok(count),
            other => Err(unexpected("Ack", other)),
        }
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
