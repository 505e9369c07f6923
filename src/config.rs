use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/var/byteblaze";
pub const DEFAULT_PORT: u16 = 6881;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one sub-directory per content, named by hex info hash.
    pub root: PathBuf,
    pub listen: SocketAddr,
    pub connect_timeout: Duration,
    /// Deadline for one piece attempt, first request to last block.
    pub piece_timeout: Duration,
    /// Give up on a download when no piece has been written for this long.
    pub stall_timeout: Duration,
    /// How long an inbound peer may stay silent before the server hangs up.
    pub idle_timeout: Duration,
    /// Also keep every verified piece as its own file so it can be served.
    pub keep_piece_files: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: PathBuf::from(DEFAULT_ROOT),
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            connect_timeout: Duration::from_secs(5),
            piece_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            keep_piece_files: false,
        }
    }
}
