use std::fmt;
use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame's declared length; anything larger is refused
/// before its payload is allocated.
pub const MAX_FRAME_LENGTH: u32 = 16 * 1024 * 1024;

pub const KEEP_ALIVE: [u8; 4] = [0; 4];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke      = 0,
    Unchoke    = 1,
    Interested = 2,
    Have       = 4,
    Bitfield   = 5,
    Request    = 6,
    Piece      = 7,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    Have { index: u32 },
    Bitfield { bitmap: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
}

/// A peer broke the wire protocol. Always fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("handshake protocol string length cannot be 0")]
    EmptyProtocolString,
    #[error("unknown handshake action {0}")]
    UnknownAction(u8),
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u32),
    #[error("{id:?} payload must be {expected} bytes, got {actual}")]
    PayloadLength { id: MessageId, expected: usize, actual: usize },
    #[error("piece payload of {0} bytes is shorter than its 8-byte header")]
    PieceTooShort(usize),
    #[error("expected a block of piece {expected}, got piece {actual}")]
    PieceIndexMismatch { expected: u32, actual: u32 },
    #[error("block of {len} bytes at offset {begin} does not fit a {capacity}-byte piece")]
    BlockOutOfBounds { begin: u32, len: usize, capacity: usize },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the remote end simply went away between frames.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, WireError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
        ))
    }
}

impl TryFrom<u8> for MessageId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            _ => Err(ProtocolError::UnknownMessageId(value)),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::Have { index } => write!(f, "have {}", index),
            Message::Bitfield { bitmap } => write!(f, "bitfield ({} bytes)", bitmap.len()),
            Message::Request { index, begin, length } => write!(f, "request {}:{}+{}", index, begin, length),
            Message::Piece { index, begin, block } => write!(f, "piece {}:{}+{}", index, begin, block.len()),
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn expect_len(id: MessageId, payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::PayloadLength { id, expected, actual: payload.len() });
    }
    Ok(())
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Choke | Message::Unchoke | Message::Interested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield { bitmap } => bitmap.len(),
            Message::Request { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
        }
    }

    /// `[4 BE length][1 id][payload]`, where length counts the id byte.
    pub fn serialize(&self) -> Vec<u8> {
        let payload_len = self.payload_len();
        let mut buf = BytesMut::with_capacity(4 + 1 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(self.id() as u8);
        match self {
            Message::Choke | Message::Unchoke | Message::Interested => (),
            Message::Have { index } => buf.put_u32(*index),
            Message::Bitfield { bitmap } => buf.put_slice(bitmap),
            Message::Request { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            },
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            },
        }
        buf.to_vec()
    }

    /// Turns an id byte and its payload into a typed message, validating the
    /// payload shape for that id.
    pub fn decode(id: u8, mut payload: Vec<u8>) -> Result<Self, ProtocolError> {
        let id = MessageId::try_from(id)?;
        match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested => {
                expect_len(id, &payload, 0)?;
                Ok(match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    _ => Message::Interested,
                })
            },
            MessageId::Have => {
                expect_len(id, &payload, 4)?;
                Ok(Message::Have { index: be_u32(&payload) })
            },
            MessageId::Bitfield => Ok(Message::Bitfield { bitmap: payload }),
            MessageId::Request => {
                expect_len(id, &payload, 12)?;
                Ok(Message::Request {
                    index: be_u32(&payload[0..4]),
                    begin: be_u32(&payload[4..8]),
                    length: be_u32(&payload[8..12]),
                })
            },
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(ProtocolError::PieceTooShort(payload.len()));
                }
                let index = be_u32(&payload[0..4]);
                let begin = be_u32(&payload[4..8]);
                payload.drain(0..8);
                Ok(Message::Piece { index, begin, block: payload })
            },
        }
    }

    /// Reads one frame. `Ok(None)` is a keep-alive.
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Self>, WireError> {
        let length = stream.read_u32().await?;
        if length == 0 {
            return Ok(None);
        }
        if length > MAX_FRAME_LENGTH {
            return Err(ProtocolError::FrameTooLarge(length).into());
        }
        let id = stream.read_u8().await?;
        let mut payload = vec![0u8; length as usize - 1];
        stream.read_exact(&mut payload).await?;
        Ok(Some(Message::decode(id, payload)?))
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> Result<(), WireError> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }
}

/// Copies a received block into the piece being assembled and returns the
/// number of bytes copied.
pub fn copy_block(expected_index: u32, buf: &mut [u8], index: u32, begin: u32, block: &[u8]) -> Result<usize, ProtocolError> {
    if index != expected_index {
        return Err(ProtocolError::PieceIndexMismatch { expected: expected_index, actual: index });
    }
    let start = begin as usize;
    if start > buf.len() || block.len() > buf.len() - start {
        return Err(ProtocolError::BlockOutOfBounds { begin, len: block.len(), capacity: buf.len() });
    }
    buf[start..start + block.len()].copy_from_slice(block);
    Ok(block.len())
}
