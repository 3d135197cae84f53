//! Wire format for chat datagrams.
//!
//! Every datagram is exactly [`PACKET_SIZE`] bytes, zero padded after the
//! last field. All integers are big-endian.
//!
//! ```text
//! +----------------+--------------+---------------------------------+
//! | magic (i64, 8) | kind (i32, 4)| type-specific fields ...        |
//! +----------------+--------------+---------------------------------+
//! ```
//!
//! Text fields are a 4-byte length followed by that many UTF-8 bytes and may
//! not exceed [`PAYLOAD_SIZE`]. The field layout depends on the direction, so
//! packets sent by clients decode as [`ClientPacket`] and packets sent by the
//! server decode as [`ServerPacket`].

use crate::user::UserId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

/// Size of every datagram on the wire.
pub const PACKET_SIZE: usize = 512;
/// Largest text field (names and chat messages) in bytes.
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - 64;
/// Sentinel written at the start of every datagram.
pub const MAGIC: i64 = -3534974220920654048;
/// Magic plus packet kind.
pub const HEADER_LEN: usize = 12;

/// Identify request target asking for every other known user.
pub const DESCRIBE_ALL: UserId = -1;
/// Login reply id signalling a name conflict.
pub const LOGIN_REJECTED: UserId = -1;
/// Resend upper bound meaning "through the end of the log".
pub const THROUGH_END: i32 = -1;

/// Packet type ids shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PacketKind {
    Login = 0,
    Message = 1,
    ResendRequest = 2,
    Identify = 3,
    Ping = 4,
    UserPingValue = 5,
    Disconnected = 6,
    Typing = 7,
}

impl PacketKind {
    pub fn from_id(id: i32) -> Option<Self> {
        let kind = match id {
            0 => Self::Login,
            1 => Self::Message,
            2 => Self::ResendRequest,
            3 => Self::Identify,
            4 => Self::Ping,
            5 => Self::UserPingValue,
            6 => Self::Disconnected,
            7 => Self::Typing,
            _ => return None,
        };
        Some(kind)
    }

    pub fn id(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown magic number {0:#018x}")]
    BadMagic(i64),
    #[error("datagram truncated")]
    Truncated,
    #[error("text length {0} out of range")]
    BadLength(i32),
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("text is {0} bytes, over the payload limit")]
    TextTooLong(usize),
}

/// Packets sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    Login { name: String },
    Message { seq: i32, text: String },
    ResendRequest { from: i32, to: i32 },
    IdentifyRequest { user_id: UserId },
    /// Echo of a server ping, returned unmodified.
    Ping { timestamp: i64, message_count: i32 },
    Disconnect,
    Typing,
}

/// Packets sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    LoginReply { user_id: UserId },
    Message { index: i32, sender_id: UserId, text: String },
    ResendRequest { from: i32, to: i32 },
    Identify { user_id: UserId, disconnected: bool, name: String },
    Ping { timestamp: i64, message_count: i32 },
    UserPing { user_id: UserId, ping_ms: i32 },
    Disconnected { user_id: UserId },
    Typing { user_id: UserId },
}

impl ClientPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Login { .. } => PacketKind::Login,
            Self::Message { .. } => PacketKind::Message,
            Self::ResendRequest { .. } => PacketKind::ResendRequest,
            Self::IdentifyRequest { .. } => PacketKind::Identify,
            Self::Ping { .. } => PacketKind::Ping,
            Self::Disconnect => PacketKind::Disconnected,
            Self::Typing => PacketKind::Typing,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = header(self.kind());
        match self {
            Self::Login { name } => put_text(&mut buf, name)?,
            Self::Message { seq, text } => {
                buf.put_i32(*seq);
                put_text(&mut buf, text)?;
            }
            Self::ResendRequest { from, to } => {
                buf.put_i32(*from);
                buf.put_i32(*to);
            }
            Self::IdentifyRequest { user_id } => buf.put_i64(*user_id),
            Self::Ping {
                timestamp,
                message_count,
            } => {
                buf.put_i64(*timestamp);
                buf.put_i32(*message_count);
            }
            Self::Disconnect | Self::Typing => {}
        }
        Ok(finish(buf))
    }

    /// Decodes a datagram sent by a client.
    ///
    /// Returns `Ok(None)` for packet kinds this version does not know.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, DecodeError> {
        let mut buf = data;
        let Some(kind) = read_header(&mut buf)? else {
            return Ok(None);
        };
        let packet = match kind {
            PacketKind::Login => Self::Login {
                name: get_text(&mut buf)?,
            },
            PacketKind::Message => Self::Message {
                seq: get_i32(&mut buf)?,
                text: get_text(&mut buf)?,
            },
            PacketKind::ResendRequest => Self::ResendRequest {
                from: get_i32(&mut buf)?,
                to: get_i32(&mut buf)?,
            },
            PacketKind::Identify => Self::IdentifyRequest {
                user_id: get_i64(&mut buf)?,
            },
            PacketKind::Ping => Self::Ping {
                timestamp: get_i64(&mut buf)?,
                message_count: get_i32(&mut buf)?,
            },
            PacketKind::Disconnected => Self::Disconnect,
            PacketKind::Typing => Self::Typing,
            // Server-only kind; nothing a client would send.
            PacketKind::UserPingValue => return Ok(None),
        };
        Ok(Some(packet))
    }
}

impl ServerPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::LoginReply { .. } => PacketKind::Login,
            Self::Message { .. } => PacketKind::Message,
            Self::ResendRequest { .. } => PacketKind::ResendRequest,
            Self::Identify { .. } => PacketKind::Identify,
            Self::Ping { .. } => PacketKind::Ping,
            Self::UserPing { .. } => PacketKind::UserPingValue,
            Self::Disconnected { .. } => PacketKind::Disconnected,
            Self::Typing { .. } => PacketKind::Typing,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = header(self.kind());
        match self {
            Self::LoginReply { user_id } => buf.put_i64(*user_id),
            Self::Message {
                index,
                sender_id,
                text,
            } => {
                buf.put_i32(*index);
                buf.put_i64(*sender_id);
                put_text(&mut buf, text)?;
            }
            Self::ResendRequest { from, to } => {
                buf.put_i32(*from);
                buf.put_i32(*to);
            }
            Self::Identify {
                user_id,
                disconnected,
                name,
            } => {
                buf.put_i64(*user_id);
                buf.put_i32(i32::from(*disconnected));
                put_text(&mut buf, name)?;
            }
            Self::Ping {
                timestamp,
                message_count,
            } => {
                buf.put_i64(*timestamp);
                buf.put_i32(*message_count);
            }
            Self::UserPing { user_id, ping_ms } => {
                buf.put_i64(*user_id);
                buf.put_i32(*ping_ms);
            }
            Self::Disconnected { user_id } | Self::Typing { user_id } => buf.put_i64(*user_id),
        }
        Ok(finish(buf))
    }

    /// Decodes a datagram sent by the server.
    ///
    /// Returns `Ok(None)` for packet kinds this version does not know.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, DecodeError> {
        let mut buf = data;
        let Some(kind) = read_header(&mut buf)? else {
            return Ok(None);
        };
        let packet = match kind {
            PacketKind::Login => Self::LoginReply {
                user_id: get_i64(&mut buf)?,
            },
            PacketKind::Message => Self::Message {
                index: get_i32(&mut buf)?,
                sender_id: get_i64(&mut buf)?,
                text: get_text(&mut buf)?,
            },
            PacketKind::ResendRequest => Self::ResendRequest {
                from: get_i32(&mut buf)?,
                to: get_i32(&mut buf)?,
            },
            PacketKind::Identify => Self::Identify {
                user_id: get_i64(&mut buf)?,
                disconnected: get_i32(&mut buf)? != 0,
                name: get_text(&mut buf)?,
            },
            PacketKind::Ping => Self::Ping {
                timestamp: get_i64(&mut buf)?,
                message_count: get_i32(&mut buf)?,
            },
            PacketKind::UserPingValue => Self::UserPing {
                user_id: get_i64(&mut buf)?,
                ping_ms: get_i32(&mut buf)?,
            },
            PacketKind::Disconnected => Self::Disconnected {
                user_id: get_i64(&mut buf)?,
            },
            PacketKind::Typing => Self::Typing {
                user_id: get_i64(&mut buf)?,
            },
        };
        Ok(Some(packet))
    }
}

/// Resolves a resend range against a buffer of `len` entries.
///
/// `to == THROUGH_END` means the end of the buffer. Returns `None` when
/// `from` is negative, `to` runs past the buffer, or `from > to`.
pub fn resolve_range(from: i32, to: i32, len: usize) -> Option<Range<usize>> {
    let to = if to == THROUGH_END {
        len
    } else {
        usize::try_from(to).ok()?
    };
    let from = usize::try_from(from).ok()?;
    if to > len || from > to {
        return None;
    }
    Some(from..to)
}

fn header(kind: PacketKind) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PACKET_SIZE);
    buf.put_i64(MAGIC);
    buf.put_i32(kind.id());
    buf
}

fn finish(mut buf: BytesMut) -> Bytes {
    buf.resize(PACKET_SIZE, 0);
    buf.freeze()
}

fn put_text(buf: &mut BytesMut, text: &str) -> Result<(), EncodeError> {
    let bytes = text.as_bytes();
    if bytes.len() > PAYLOAD_SIZE {
        return Err(EncodeError::TextTooLong(bytes.len()));
    }
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
    Ok(())
}

fn read_header(buf: &mut &[u8]) -> Result<Option<PacketKind>, DecodeError> {
    let magic = get_i64(buf)?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    Ok(PacketKind::from_id(get_i32(buf)?))
}

fn get_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::Truncated);
    }
    Ok(buf.get_i64())
}

fn get_text(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = get_i32(buf)?;
    let size = usize::try_from(len)
        .ok()
        .filter(|size| *size <= PAYLOAD_SIZE)
        .ok_or(DecodeError::BadLength(len))?;
    if buf.remaining() < size {
        return Err(DecodeError::Truncated);
    }
    let text = std::str::from_utf8(&buf[..size])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_owned();
    buf.advance(size);
    Ok(text)
}
