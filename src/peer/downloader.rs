use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metadata::descriptor::TorrentDescriptor;
use crate::peer::connection::{ConnectError, PeerConnection};
use crate::peer::message::{Message, WireError, copy_block};
use crate::peer::queue::{PieceWork, WorkQueue};
use crate::peer::storage::{OutputFile, PieceStore, StorageError};
use crate::peer::{Bitfield, PeerId};
use crate::util::{self, sha1_hash};

/// Largest block a single request asks for.
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Requests kept in flight per piece.
pub const MAX_BACKLOG: usize = 5;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peers to download from")]
    NoPeers,
    #[error("every peer disconnected with {completed} of {total} pieces written")]
    PeersExhausted { completed: usize, total: usize },
    #[error("no piece arrived for {after:?} with {completed} of {total} pieces written")]
    Stalled { completed: usize, total: usize, after: Duration },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why a single piece attempt was abandoned.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("piece not complete within {0:?}")]
    Timeout(Duration),
    #[error("piece hashed to {received}, expected {expected}")]
    Integrity { expected: String, received: String },
}

#[derive(Debug, Error)]
enum WorkerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
}

#[derive(Debug)]
pub struct PieceResult {
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub pieces: usize,
}

#[derive(Debug)]
struct PieceProgress {
    index: u32,
    buf: Vec<u8>,
    downloaded: usize,
    requested: usize,
    backlog: usize,
}

impl PieceProgress {
    fn new(work: &PieceWork) -> Self {
        PieceProgress { index: work.index, buf: vec![0; work.length], downloaded: 0, requested: 0, backlog: 0 }
    }

    fn next_block_size(&self) -> u32 {
        MAX_BLOCK_SIZE.min((self.buf.len() - self.requested) as u32)
    }

    async fn download(&mut self, conn: &mut PeerConnection) -> Result<(), WireError> {
        while self.downloaded < self.buf.len() {
            if !conn.choked {
                while self.backlog < MAX_BACKLOG && self.requested < self.buf.len() {
                    let block_size = self.next_block_size();
                    conn.send_request(self.index, self.requested as u32, block_size).await?;
                    self.backlog += 1;
                    self.requested += block_size as usize;
                }
            }
            self.read_message(conn).await?;
        }
        Ok(())
    }

    async fn read_message(&mut self, conn: &mut PeerConnection) -> Result<(), WireError> {
        let Some(message) = conn.read().await? else {
            return Ok(());
        };
        match message {
            Message::Piece { index, begin, block } => {
                self.downloaded += copy_block(self.index, &mut self.buf, index, begin, &block)?;
                self.backlog = self.backlog.saturating_sub(1);
            },
            other => conn.apply(&other),
        }
        Ok(())
    }
}

async fn attempt_download_piece(conn: &mut PeerConnection, work: &PieceWork, deadline: Duration) -> Result<Vec<u8>, AttemptError> {
    let mut progress = PieceProgress::new(work);
    timeout(deadline, progress.download(conn))
        .await
        .map_err(|_| AttemptError::Timeout(deadline))??;

    let hash = sha1_hash(&progress.buf);
    if hash != work.hash {
        return Err(AttemptError::Integrity { expected: util::to_string(&work.hash), received: util::to_string(&hash) });
    }
    Ok(progress.buf)
}

/// Drives a download: one worker per peer pulling from a shared queue, and a
/// single collector writing verified pieces into the output file.
#[derive(Debug, Clone)]
pub struct PieceScheduler {
    config: Arc<Config>,
}

impl PieceScheduler {
    pub fn new(config: Config) -> Self {
        PieceScheduler { config: Arc::new(config) }
    }

    pub async fn download(
        &self,
        descriptor: Arc<TorrentDescriptor>,
        peers: &[SocketAddr],
        local_peer_id: PeerId,
    ) -> Result<CompletionReport, DownloadError> {
        info!(name = %descriptor.name, pieces = descriptor.num_pieces(), peers = peers.len(), "starting download");
        if descriptor.num_pieces() > 0 && peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }
        let store = PieceStore::new(&self.config.root, &descriptor.info_hash);
        let output = store.create_output(&descriptor.name, descriptor.total_length).await?;

        let queue = Arc::new(WorkQueue::new((0..descriptor.num_pieces()).map(|index| PieceWork {
            index: index as u32,
            hash: descriptor.piece_hashes[index],
            length: descriptor.piece_size(index) as usize,
        })));
        let (results_tx, results_rx) = mpsc::channel(1);

        let mut workers = JoinSet::new();
        for &peer in peers {
            let worker = Worker {
                address: peer,
                descriptor: descriptor.clone(),
                local_peer_id,
                queue: queue.clone(),
                results: results_tx.clone(),
                config: self.config.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(results_tx);

        let outcome = self.collect(&descriptor, &store, output, results_rx).await;
        queue.close().await;
        if outcome.is_ok() {
            while workers.join_next().await.is_some() {}
        } else {
            workers.abort_all();
        }
        outcome
    }

    async fn collect(
        &self,
        descriptor: &TorrentDescriptor,
        store: &PieceStore,
        mut output: OutputFile,
        mut results: mpsc::Receiver<PieceResult>,
    ) -> Result<CompletionReport, DownloadError> {
        let total = descriptor.num_pieces();
        let mut done = Bitfield::new(total);
        let mut bytes_written = 0u64;

        while done.num_set() < total {
            let completed = done.num_set();
            let result = match timeout(self.config.stall_timeout, results.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => return Err(DownloadError::PeersExhausted { completed, total }),
                Err(_) => return Err(DownloadError::Stalled { completed, total, after: self.config.stall_timeout }),
            };
            if done.has_piece(result.index as usize) {
                warn!(piece = result.index, "dropping duplicate piece");
                continue;
            }

            let (begin, _) = descriptor.piece_bounds(result.index as usize);
            output.write_at(begin, &result.data).await?;
            if self.config.keep_piece_files {
                store.write_piece(result.index, &result.data).await?;
            }
            done.set_piece(result.index as usize);
            bytes_written += result.data.len() as u64;

            let percent = done.num_set() as f32 * 100.0 / total as f32;
            info!(piece = result.index, "({:.2}%) downloaded piece", percent);
        }

        let path = output.finish().await?;
        info!(path = %path.display(), bytes = bytes_written, "download complete");
        Ok(CompletionReport { path, bytes_written, pieces: total })
    }
}

struct Worker {
    address: SocketAddr,
    descriptor: Arc<TorrentDescriptor>,
    local_peer_id: PeerId,
    queue: Arc<WorkQueue>,
    results: mpsc::Sender<PieceResult>,
    config: Arc<Config>,
}

impl Worker {
    async fn run(self) {
        let address = self.address;
        match self.download().await {
            Ok(()) => debug!(peer = %address, "worker finished"),
            Err(e) => warn!(peer = %address, "worker exiting: {}", e),
        }
    }

    async fn download(self) -> Result<(), WorkerError> {
        let mut conn = PeerConnection::connect(
            self.address,
            &self.local_peer_id,
            &self.descriptor.info_hash,
            self.descriptor.num_pieces(),
            self.config.connect_timeout,
        )
        .await?;
        info!(peer = %self.address, pieces = conn.bitfield.num_set(), "connected");

        conn.send_unchoke().await?;
        conn.send_interested().await?;

        while let Some(work) = self.queue.next_for(&conn.bitfield).await {
            let data = match attempt_download_piece(&mut conn, &work, self.config.piece_timeout).await {
                Ok(data) => data,
                Err(e @ AttemptError::Integrity { .. }) => {
                    warn!(peer = %self.address, piece = work.index, "{}", e);
                    self.queue.push(work).await;
                    continue;
                },
                Err(e) => {
                    self.queue.push(work).await;
                    return Err(e.into());
                },
            };

            if let Err(e) = conn.send_have(work.index).await {
                self.queue.push(work).await;
                return Err(e.into());
            }
            if self.results.send(PieceResult { index: work.index, data }).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_block_is_clipped() {
        let work = PieceWork { index: 0, hash: [0; 20], length: MAX_BLOCK_SIZE as usize * 2 + 100 };
        let mut progress = PieceProgress::new(&work);
        assert_eq!(progress.next_block_size(), MAX_BLOCK_SIZE);
        progress.requested = MAX_BLOCK_SIZE as usize * 2;
        assert_eq!(progress.next_block_size(), 100);
    }
}
