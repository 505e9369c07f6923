pub mod config;
pub mod metadata;
pub mod peer;
pub mod session;
pub mod util;

pub use config::Config;
pub use metadata::descriptor::{DescriptorError, TorrentDescriptor};
pub use peer::connection::{ConnectError, PeerConnection};
pub use peer::downloader::{CompletionReport, DownloadError, MAX_BACKLOG, MAX_BLOCK_SIZE, PieceScheduler};
pub use peer::handshake::{Action, Handshake, HandshakeError};
pub use peer::message::{Message, MessageId, ProtocolError, WireError, copy_block};
pub use peer::server::{Broadcast, MAX_DESCRIPTOR_LENGTH, RequestServer, ServeError, serve_request};
pub use peer::storage::{PieceStore, StorageError};
pub use peer::{Bitfield, PeerId, generate_peer_id};
pub use session::{Session, SessionError};
