use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Config;
use crate::peer::handshake::{Action, Handshake};
use crate::peer::message::{Message, WireError};
use crate::peer::storage::{PieceStore, StorageError};
use crate::peer::{Bitfield, PeerId};
use crate::util;

/// Largest descriptor accepted from a broadcasting host.
pub const MAX_DESCRIPTOR_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("peer asked for piece {0}, which is not stored here")]
    MissingPiece(u32),
    #[error("peer asked for offset {begin} of piece {index}, which is only {len} bytes")]
    OffsetOutOfRange { index: u32, begin: u32, len: usize },
    #[error("peer sent nothing for {0:?}")]
    Idle(Duration),
    #[error("broadcast descriptor exceeds {MAX_DESCRIPTOR_LENGTH} bytes")]
    DescriptorTooLarge,
}

impl From<io::Error> for ServeError {
    fn from(e: io::Error) -> Self {
        ServeError::Wire(WireError::Io(e))
    }
}

/// A descriptor pushed to us by another host, handed to whoever owns the
/// server so it can start the download or pass it on.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub action: Action,
    pub info_hash: [u8; 20],
    pub from: SocketAddr,
    pub descriptor: Vec<u8>,
}

#[derive(Debug)]
pub struct RequestServer {
    listener: TcpListener,
    config: Arc<Config>,
    peer_id: PeerId,
    broadcasts: Option<mpsc::Sender<Broadcast>>,
}

impl RequestServer {
    pub async fn bind(config: &Config, peer_id: PeerId) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(RequestServer { listener, config: Arc::new(config.clone()), peer_id, broadcasts: None })
    }

    pub fn with_broadcasts(mut self, sender: mpsc::Sender<Broadcast>) -> Self {
        self.broadcasts = Some(sender);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(address = %self.listener.local_addr()?, "listening for peers");
        loop {
            let (stream, address) = self.listener.accept().await?;
            debug!(peer = %address, "received connection");
            let config = self.config.clone();
            let peer_id = self.peer_id;
            let broadcasts = self.broadcasts.clone();
            tokio::spawn(
                async move {
                    match handle_connection(stream, address, &config, peer_id, broadcasts).await {
                        Ok(()) => debug!("connection closed"),
                        Err(e) => warn!("connection aborted: {}", e),
                    }
                }
                .instrument(info_span!("inbound", peer = %address)),
            );
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    address: SocketAddr,
    config: &Config,
    peer_id: PeerId,
    broadcasts: Option<mpsc::Sender<Broadcast>>,
) -> Result<(), ServeError> {
    let handshake = timeout(config.idle_timeout, Handshake::read(&mut stream))
        .await
        .map_err(|_| ServeError::Idle(config.idle_timeout))??;
    debug!(action = ?handshake.action, info_hash = %util::to_string(&handshake.info_hash), "read handshake");

    let ack = Handshake::new(Action::Ack, handshake.info_hash, peer_id);
    match handshake.action {
        Action::Request => {
            stream.write_all(&ack.serialize()).await?;
            serve_request(&mut stream, config, &handshake.info_hash, &handshake.peer_id).await
        },
        Action::ReceiveBroadcast | Action::SendBroadcast => {
            stream.write_all(&ack.serialize()).await?;
            let descriptor = timeout(config.idle_timeout, read_descriptor(&mut stream))
                .await
                .map_err(|_| ServeError::Idle(config.idle_timeout))??;
            let store = PieceStore::new(&config.root, &handshake.info_hash);
            let path = store.write_descriptor(&descriptor).await?;
            info!(path = %path.display(), bytes = descriptor.len(), "stored broadcast descriptor");
            if let Some(sender) = broadcasts {
                let broadcast = Broadcast { action: handshake.action, info_hash: handshake.info_hash, from: address, descriptor };
                if sender.send(broadcast).await.is_err() {
                    warn!("nobody is listening for broadcasts");
                }
            }
            Ok(())
        },
        Action::Ack => {
            debug!("unsolicited ack, closing");
            Ok(())
        },
    }
}

/// Reads a broadcast descriptor up to EOF, refusing anything longer than
/// [`MAX_DESCRIPTOR_LENGTH`].
pub(crate) async fn read_descriptor<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, ServeError> {
    let mut descriptor = Vec::new();
    (&mut *stream).take(MAX_DESCRIPTOR_LENGTH as u64 + 1).read_to_end(&mut descriptor).await?;
    if descriptor.len() > MAX_DESCRIPTOR_LENGTH {
        return Err(ServeError::DescriptorTooLarge);
    }
    Ok(descriptor)
}

/// Serves a peer whose content request has already been acknowledged: sends
/// the bitfield of stored pieces, then answers requests until it hangs up or
/// stays silent for `config.idle_timeout`. Piece files are read on demand.
pub async fn serve_request<S>(conn: &mut S, config: &Config, info_hash: &[u8; 20], peer_id: &PeerId) -> Result<(), ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let store = PieceStore::new(&config.root, info_hash);
    let indices = store.stored_indices().await?;
    let num = indices.last().map_or(0, |&last| last as usize + 1);
    let mut bitfield = Bitfield::new(num);
    for &index in &indices {
        bitfield.set_piece(index as usize);
    }
    debug!(
        peer_id = %String::from_utf8_lossy(peer_id),
        pieces = indices.len(),
        "sending bitfield {}",
        util::to_string(bitfield.as_bytes())
    );
    Message::Bitfield { bitmap: bitfield.as_bytes().to_vec() }.write(conn).await?;

    // Blocks of one piece are requested back to back.
    let mut current: Option<(u32, Vec<u8>)> = None;
    loop {
        let message = match timeout(config.idle_timeout, Message::read(conn)).await {
            Err(_) => return Err(ServeError::Idle(config.idle_timeout)),
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) if e.is_disconnect() => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
        };
        match message {
            Message::Unchoke | Message::Choke => message.write(conn).await?,
            Message::Request { index, begin, length } => {
                if !bitfield.has_piece(index as usize) {
                    return Err(ServeError::MissingPiece(index));
                }
                if current.as_ref().map(|(cached, _)| *cached) != Some(index) {
                    current = Some((index, store.read_piece(index).await?));
                }
                let piece: &[u8] = current.as_ref().map(|(_, data)| data.as_slice()).unwrap_or_default();
                let start = begin as usize;
                if start > piece.len() {
                    return Err(ServeError::OffsetOutOfRange { index, begin, len: piece.len() });
                }
                let end = start.saturating_add(length as usize).min(piece.len());
                let reply = Message::Piece { index, begin, block: piece[start..end].to_vec() };
                reply.write(conn).await?;
            },
            other => debug!("ignoring {}", other),
        }
    }
}
