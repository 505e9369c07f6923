use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use byteblaze::peer::message::KEEP_ALIVE;
use byteblaze::util::sha1_hash;
use byteblaze::{
    Action, Bitfield, Config, DownloadError, Handshake, Message, PieceScheduler, PieceStore, StorageError, TorrentDescriptor,
    generate_peer_id,
};

const PIECE_LENGTH: u64 = 40_000;

#[derive(Debug, Clone, Copy)]
struct Behavior {
    corrupt: Option<u32>,
    keep_alives: bool,
    unchoke: bool,
    hang_up_after_handshake: bool,
    malformed_reply: bool,
    delay: Duration,
}

impl Default for Behavior {
    fn default() -> Self {
        Behavior {
            corrupt: None,
            keep_alives: false,
            unchoke: true,
            hang_up_after_handshake: false,
            malformed_reply: false,
            delay: Duration::ZERO,
        }
    }
}

struct FakePeer {
    address: SocketAddr,
    pieces_served: Arc<AtomicUsize>,
}

fn payload() -> Vec<u8> {
    (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect()
}

fn config(root: &Path) -> Config {
    Config {
        root: root.to_path_buf(),
        listen: "127.0.0.1:0".parse().unwrap(),
        connect_timeout: Duration::from_secs(2),
        piece_timeout: Duration::from_secs(5),
        stall_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(5),
        keep_piece_files: false,
    }
}

async fn spawn_fake_peer(descriptor: &TorrentDescriptor, data: &[u8], held: &[u32], behavior: Behavior) -> FakePeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let pieces: Vec<Option<Vec<u8>>> = (0..descriptor.num_pieces())
        .map(|i| {
            held.contains(&(i as u32)).then(|| {
                let (begin, end) = descriptor.piece_bounds(i);
                data[begin as usize..end as usize].to_vec()
            })
        })
        .collect();
    let pieces_served = Arc::new(AtomicUsize::new(0));
    let counter = pieces_served.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(run_fake_peer(stream, pieces.clone(), behavior, counter.clone()));
        }
    });
    FakePeer { address, pieces_served }
}

async fn run_fake_peer(mut stream: TcpStream, pieces: Vec<Option<Vec<u8>>>, behavior: Behavior, served: Arc<AtomicUsize>) {
    let Ok(request) = Handshake::read(&mut stream).await else {
        return;
    };
    assert_eq!(request.action, Action::Request);
    let ack = Handshake::new(Action::Ack, request.info_hash, *b"-FAKE00-000000000000");
    if stream.write_all(&ack.serialize()).await.is_err() || behavior.hang_up_after_handshake {
        return;
    }

    tokio::time::sleep(behavior.delay).await;
    let mut bitfield = Bitfield::new(pieces.len());
    for (index, piece) in pieces.iter().enumerate() {
        if piece.is_some() {
            bitfield.set_piece(index);
        }
    }
    if (Message::Bitfield { bitmap: bitfield.as_bytes().to_vec() }).write(&mut stream).await.is_err() {
        return;
    }
    if behavior.unchoke && Message::Unchoke.write(&mut stream).await.is_err() {
        return;
    }

    loop {
        let message = match Message::read(&mut stream).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(_) => return,
        };
        let Message::Request { index, begin, length } = message else {
            continue;
        };
        if behavior.malformed_reply {
            // A REQUEST frame with a 10-byte payload.
            let _ = stream.write_all(&[0, 0, 0, 11, 6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await;
            return;
        }
        let Some(Some(piece)) = pieces.get(index as usize) else {
            return;
        };
        let start = begin as usize;
        let end = (start + length as usize).min(piece.len());
        let mut block = piece[start..end].to_vec();
        let tampered = behavior.corrupt == Some(index);
        if tampered {
            if let Some(byte) = block.first_mut() {
                *byte ^= 0xFF;
            }
        }
        if behavior.keep_alives && stream.write_all(&KEEP_ALIVE).await.is_err() {
            return;
        }
        let last_block = end == piece.len();
        if last_block {
            served.fetch_add(1, Ordering::SeqCst);
        }
        if (Message::Piece { index, begin, block }).write(&mut stream).await.is_err() || (last_block && tampered) {
            return;
        }
    }
}

fn assert_assembled(path: &Path, descriptor: &TorrentDescriptor, data: &[u8]) {
    let written = std::fs::read(path).unwrap();
    assert_eq!(written.len() as u64, descriptor.total_length);
    for index in 0..descriptor.num_pieces() {
        let (begin, end) = descriptor.piece_bounds(index);
        assert_eq!(sha1_hash(&written[begin as usize..end as usize]), descriptor.piece_hashes[index], "piece {index}");
    }
    assert_eq!(written, data);
}

#[tokio::test]
async fn assembles_three_pieces_from_two_peers() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    assert_eq!(descriptor.num_pieces(), 3);
    let a = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior::default()).await;
    let b = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior::default()).await;

    let tmp = TempDir::new().unwrap();
    let report = PieceScheduler::new(config(tmp.path()))
        .download(descriptor.clone(), &[a.address, b.address], generate_peer_id())
        .await
        .unwrap();

    assert_eq!(report.bytes_written, 100_000);
    assert_eq!(report.pieces, 3);
    assert_assembled(&report.path, &descriptor, &data);
    let served = a.pieces_served.load(Ordering::SeqCst) + b.pieces_served.load(Ordering::SeqCst);
    assert_eq!(served, 3);
}

#[tokio::test]
async fn pieces_only_come_from_peers_that_have_them() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let a = spawn_fake_peer(&descriptor, &data, &[0, 1], Behavior::default()).await;
    let b = spawn_fake_peer(&descriptor, &data, &[2], Behavior::default()).await;

    let tmp = TempDir::new().unwrap();
    let report = PieceScheduler::new(config(tmp.path()))
        .download(descriptor.clone(), &[a.address, b.address], generate_peer_id())
        .await
        .unwrap();

    assert_assembled(&report.path, &descriptor, &data);
    assert_eq!(a.pieces_served.load(Ordering::SeqCst), 2);
    assert_eq!(b.pieces_served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tampered_piece_is_fetched_again_from_another_peer() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let tampering = spawn_fake_peer(&descriptor, &data, &[1], Behavior { corrupt: Some(1), ..Behavior::default() }).await;
    let honest = spawn_fake_peer(
        &descriptor,
        &data,
        &[0, 1, 2],
        Behavior { delay: Duration::from_millis(300), ..Behavior::default() },
    )
    .await;

    let tmp = TempDir::new().unwrap();
    let report = PieceScheduler::new(config(tmp.path()))
        .download(descriptor.clone(), &[tampering.address, honest.address], generate_peer_id())
        .await
        .unwrap();

    assert_assembled(&report.path, &descriptor, &data);
    assert_eq!(tampering.pieces_served.load(Ordering::SeqCst), 1);
    assert_eq!(honest.pieces_served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn malformed_reply_drops_the_peer_and_its_piece_is_refetched() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let garbled = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior { malformed_reply: true, ..Behavior::default() }).await;
    let honest = spawn_fake_peer(
        &descriptor,
        &data,
        &[0, 1, 2],
        Behavior { delay: Duration::from_millis(300), ..Behavior::default() },
    )
    .await;

    let tmp = TempDir::new().unwrap();
    let report = PieceScheduler::new(config(tmp.path()))
        .download(descriptor.clone(), &[garbled.address, honest.address], generate_peer_id())
        .await
        .unwrap();

    assert_assembled(&report.path, &descriptor, &data);
    assert_eq!(garbled.pieces_served.load(Ordering::SeqCst), 0);
    assert_eq!(honest.pieces_served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn keep_alives_between_blocks_are_ignored() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let peer = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior { keep_alives: true, ..Behavior::default() }).await;

    let tmp = TempDir::new().unwrap();
    let report = PieceScheduler::new(config(tmp.path()))
        .download(descriptor.clone(), &[peer.address], generate_peer_id())
        .await
        .unwrap();
    assert_assembled(&report.path, &descriptor, &data);
}

#[tokio::test]
async fn kept_piece_files_are_written_beside_the_output() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let peer = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior::default()).await;

    let tmp = TempDir::new().unwrap();
    let config = Config { keep_piece_files: true, ..config(tmp.path()) };
    PieceScheduler::new(config).download(descriptor.clone(), &[peer.address], generate_peer_id()).await.unwrap();

    let store = PieceStore::new(tmp.path(), &descriptor.info_hash);
    let pieces = store.load_pieces().await.unwrap();
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[&2], data[80_000..]);
}

#[tokio::test]
async fn output_named_like_a_piece_is_refused() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("1", &data, PIECE_LENGTH).unwrap());
    let peer = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior::default()).await;

    let tmp = TempDir::new().unwrap();
    let config = Config { keep_piece_files: true, ..config(tmp.path()) };
    let err = PieceScheduler::new(config).download(descriptor.clone(), &[peer.address], generate_peer_id()).await.unwrap_err();

    assert!(matches!(err, DownloadError::Storage(StorageError::InvalidName(ref name)) if name == "1"));
    assert!(!PieceStore::new(tmp.path(), &descriptor.info_hash).dir().join("1").exists());
    assert_eq!(peer.pieces_served.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_peer_list_is_rejected() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let tmp = TempDir::new().unwrap();
    let err = PieceScheduler::new(config(tmp.path())).download(descriptor, &[], generate_peer_id()).await.unwrap_err();
    assert!(matches!(err, DownloadError::NoPeers));
}

#[tokio::test]
async fn download_fails_once_every_peer_is_gone() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let quitter = spawn_fake_peer(&descriptor, &data, &[], Behavior { hang_up_after_handshake: true, ..Behavior::default() }).await;
    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let tmp = TempDir::new().unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        PieceScheduler::new(config(tmp.path())).download(descriptor, &[quitter.address, refused], generate_peer_id()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, DownloadError::PeersExhausted { completed: 0, total: 3 }));
}

#[tokio::test]
async fn choking_peer_trips_the_stall_watchdog() {
    let data = payload();
    let descriptor = Arc::new(TorrentDescriptor::from_content("payload.bin", &data, PIECE_LENGTH).unwrap());
    let choker = spawn_fake_peer(&descriptor, &data, &[0, 1, 2], Behavior { unchoke: false, ..Behavior::default() }).await;

    let tmp = TempDir::new().unwrap();
    let config = Config { stall_timeout: Duration::from_millis(300), ..config(tmp.path()) };
    let err = PieceScheduler::new(config).download(descriptor, &[choker.address], generate_peer_id()).await.unwrap_err();
    assert!(matches!(err, DownloadError::Stalled { completed: 0, total: 3, .. }));
}
