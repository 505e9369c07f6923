use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::peer::handshake::{self, Action, HandshakeError};
use crate::peer::message::{Message, WireError};
use crate::peer::{Bitfield, PeerId};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not connect: {0}")]
    Connect(std::io::Error),
    #[error("no handshake within {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
}

/// One live session with a remote peer, seen from the downloading side.
#[derive(Debug)]
pub struct PeerConnection {
    pub address: SocketAddr,
    pub peer_id: PeerId,
    pub choked: bool,
    pub bitfield: Bitfield,
    stream: TcpStream,
}

impl PeerConnection {
    /// Dials `address`, asks it for `info_hash` and takes the first message as
    /// its bitfield. A peer that opens with anything else is assumed to hold
    /// nothing, since peers without pieces may skip the bitfield.
    pub async fn connect(
        address: SocketAddr,
        local_peer_id: &PeerId,
        info_hash: &[u8; 20],
        num_pieces: usize,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        tokio::time::timeout(timeout, Self::establish(address, local_peer_id, info_hash, num_pieces))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))?
    }

    async fn establish(address: SocketAddr, local_peer_id: &PeerId, info_hash: &[u8; 20], num_pieces: usize) -> Result<Self, ConnectError> {
        let mut stream = TcpStream::connect(address).await.map_err(ConnectError::Connect)?;
        let theirs = handshake::initiate(&mut stream, Action::Request, info_hash, local_peer_id).await?;

        let bitfield = match Message::read(&mut stream).await.map_err(HandshakeError::from)? {
            Some(Message::Bitfield { bitmap }) => Bitfield::from_bytes(bitmap, num_pieces),
            Some(other) => {
                debug!(peer = %address, "opened with {} instead of a bitfield", other);
                Bitfield::new(num_pieces)
            },
            None => {
                debug!(peer = %address, "opened with a keep-alive instead of a bitfield");
                Bitfield::new(num_pieces)
            },
        };

        Ok(PeerConnection { address, peer_id: theirs.peer_id, choked: true, bitfield, stream })
    }

    pub async fn read(&mut self) -> Result<Option<Message>, WireError> {
        Message::read(&mut self.stream).await
    }

    /// Folds a state-changing message into our view of the peer.
    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::Unchoke => self.choked = false,
            Message::Choke => self.choked = true,
            Message::Have { index } => self.bitfield.set_piece(*index as usize),
            Message::Bitfield { bitmap } => self.bitfield = Bitfield::from_bytes(bitmap.clone(), self.bitfield.num),
            _ => debug!(peer = %self.address, "ignoring {}", message),
        }
    }

    async fn send(&mut self, message: Message) -> Result<(), WireError> {
        message.write(&mut self.stream).await
    }

    pub async fn send_interested(&mut self) -> Result<(), WireError> {
        self.send(Message::Interested).await
    }

    pub async fn send_unchoke(&mut self) -> Result<(), WireError> {
        self.send(Message::Unchoke).await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<(), WireError> {
        self.send(Message::Have { index }).await
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), WireError> {
        self.send(Message::Request { index, begin, length }).await
    }
}
