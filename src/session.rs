use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::config::Config;
use crate::metadata::descriptor::{DescriptorError, TorrentDescriptor};
use crate::peer::downloader::{CompletionReport, DownloadError, PieceScheduler};
use crate::peer::server::{Broadcast, RequestServer};
use crate::peer::{PeerId, generate_peer_id};
use crate::util;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("broadcast announced {announced} but carried a torrent for {actual}")]
    InfoHashMismatch { announced: String, actual: String },
}

/// Everything one run of the client owns: its settings, its identity on the
/// wire and the peers it knows about.
#[derive(Debug)]
pub struct Session {
    config: Config,
    peer_id: PeerId,
    peers: Mutex<Vec<SocketAddr>>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        Session { config, peer_id: generate_peer_id(), peers: Mutex::new(Vec::new()) }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = peer_id;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Returns false when the peer was already known.
    pub async fn add_peer(&self, address: SocketAddr) -> bool {
        let mut peers = self.peers.lock().await;
        if peers.contains(&address) {
            return false;
        }
        debug!(peer = %address, "added peer");
        peers.push(address);
        true
    }

    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().await.clone()
    }

    /// Downloads `descriptor` from every peer known at the time of the call.
    pub async fn download(&self, descriptor: TorrentDescriptor) -> Result<CompletionReport, DownloadError> {
        let peers = self.peers().await;
        PieceScheduler::new(self.config.clone()).download(Arc::new(descriptor), &peers, self.peer_id).await
    }

    /// Fetches the content a broadcast announced. The sender is assumed to
    /// serve on the same port this session listens on.
    pub async fn download_broadcast(&self, broadcast: &Broadcast) -> Result<CompletionReport, SessionError> {
        let descriptor = TorrentDescriptor::from_bytes(&broadcast.descriptor)?;
        if descriptor.info_hash != broadcast.info_hash {
            return Err(SessionError::InfoHashMismatch {
                announced: util::to_string(&broadcast.info_hash),
                actual: util::to_string(&descriptor.info_hash),
            });
        }
        let sender = SocketAddr::new(broadcast.from.ip(), self.config.listen.port());
        self.add_peer(sender).await;
        info!(from = %broadcast.from, "downloading broadcast torrent {}", descriptor.name);
        Ok(self.download(descriptor).await?)
    }

    /// Binds the request server. Broadcast descriptors it receives are
    /// delivered on `broadcasts` when given.
    pub async fn serve(&self, broadcasts: Option<mpsc::Sender<Broadcast>>) -> io::Result<RequestServer> {
        let server = RequestServer::bind(&self.config, self.peer_id).await?;
        Ok(match broadcasts {
            Some(sender) => server.with_broadcasts(sender),
            None => server,
        })
    }
}
