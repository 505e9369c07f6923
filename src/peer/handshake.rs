use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::peer::PeerId;
use crate::peer::message::{ProtocolError, WireError};
use crate::util;

pub const P_STR: &[u8] = b"BitTorrent protocol";

/// What the initiating side wants from the connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ack              = 0,
    Request          = 1,
    ReceiveBroadcast = 2,
    SendBroadcast    = 3,
}

impl TryFrom<u8> for Action {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Action::Ack),
            1 => Ok(Action::Request),
            2 => Ok(Action::ReceiveBroadcast),
            3 => Ok(Action::SendBroadcast),
            _ => Err(ProtocolError::UnknownAction(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub pstr: Vec<u8>,
    pub action: Action,
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer answered for info hash {received} instead of {expected}")]
    InfoHashMismatch { expected: String, received: String },
}

impl Handshake {
    pub fn new(action: Action, info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Handshake { pstr: P_STR.to_vec(), action, info_hash, peer_id }
    }

    /// `[len][pstr][action][7 reserved][info hash][peer id]`, `len + 49` bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pstr.len() + 49);
        buf.push(self.pstr.len() as u8);
        buf.extend_from_slice(&self.pstr);
        buf.push(self.action as u8);
        buf.extend_from_slice(&[0; 7]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Reserved bytes and the protocol string itself are accepted as sent.
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Self, WireError> {
        let pstr_len = stream.read_u8().await? as usize;
        if pstr_len == 0 {
            return Err(ProtocolError::EmptyProtocolString.into());
        }
        let mut buf = vec![0u8; pstr_len + 48];
        stream.read_exact(&mut buf).await?;

        let action = Action::try_from(buf[pstr_len])?;
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[pstr_len + 8..pstr_len + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[pstr_len + 28..pstr_len + 48]);
        buf.truncate(pstr_len);

        Ok(Handshake { pstr: buf, action, info_hash, peer_id })
    }
}

/// Sends our handshake for `info_hash`, then reads the peer's answer and
/// checks that it speaks for the same content.
pub(crate) async fn initiate<S>(stream: &mut S, action: Action, info_hash: &[u8; 20], peer_id: &PeerId) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mine = Handshake::new(action, *info_hash, *peer_id);
    stream.write_all(&mine.serialize()).await.map_err(WireError::from)?;
    let theirs = Handshake::read(stream).await?;
    debug!(action = ?theirs.action, peer_id = %String::from_utf8_lossy(&theirs.peer_id), "handshake answered");
    if theirs.info_hash != mine.info_hash {
        return Err(HandshakeError::InfoHashMismatch {
            expected: util::to_string(&mine.info_hash),
            received: util::to_string(&theirs.info_hash),
        });
    }
    Ok(theirs)
}
