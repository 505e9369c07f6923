use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use time::macros::format_description;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use byteblaze::config::{DEFAULT_PORT, DEFAULT_ROOT};
use byteblaze::{Config, PieceStore, Session, TorrentDescriptor};

#[derive(Parser, Debug)]
#[command(name = "byteblaze", version)]
struct Args {
    #[arg(long, global = true, default_value = DEFAULT_ROOT, help = "Directory holding downloaded and seeded content")]
    root: PathBuf,

    #[arg(long, global = true, help = "Log to stderr instead of logs/byteblaze.log")]
    stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the content of a torrent file from the given peers
    Download {
        torrent: PathBuf,

        #[arg(short, long = "peer", required = true, help = "Peer to download from, may be repeated")]
        peers: Vec<SocketAddr>,

        #[arg(long, help = "Also keep every verified piece so it can be served")]
        keep_pieces: bool,
    },
    /// Answer piece requests and download the content of broadcast torrent files
    Serve {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        listen: SocketAddr,

        #[arg(short, long = "peer", help = "Extra peer to fetch broadcast content from, may be repeated")]
        peers: Vec<SocketAddr>,
    },
    /// Print the contents of a torrent file
    Inspect { torrent: PathBuf },
    /// Write a torrent file describing a local file
    Create {
        file: PathBuf,

        #[arg(long, default_value_t = 256 * 1024)]
        piece_length: u64,

        #[arg(short, long, help = "Where to write the torrent file [default: <FILE>.torrent]")]
        output: Option<PathBuf>,

        #[arg(long, help = "Split the file into pieces under --root so it can be served")]
        seed: bool,
    },
}

fn init_logging(stderr: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    if stderr {
        tracing_subscriber::fmt().with_writer(std::io::stderr).with_timer(timer).init();
        return None;
    }
    let file_appender = tracing_appender::rolling::never("logs", "byteblaze.log");
    let (non_blocking, guard) = non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).with_ansi(false).with_timer(timer).init();
    Some(guard)
}

async fn download(config: Config, torrent: &Path, peers: Vec<SocketAddr>) -> Result<(), Box<dyn Error>> {
    let bytes = tokio::fs::read(torrent).await?;
    let descriptor = TorrentDescriptor::from_bytes(&bytes)?;
    let session = Session::new(config);
    for peer in peers {
        session.add_peer(peer).await;
    }
    let report = session.download(descriptor).await?;
    println!("Downloaded {} bytes in {} pieces to {}", report.bytes_written, report.pieces, report.path.display());
    Ok(())
}

async fn serve(config: Config, peers: Vec<SocketAddr>) -> Result<(), Box<dyn Error>> {
    let session = Arc::new(Session::new(config));
    for peer in peers {
        session.add_peer(peer).await;
    }
    let (tx, mut rx) = mpsc::channel(8);
    let server = session.serve(Some(tx)).await?;
    println!("Serving {} on {}", session.config().root.display(), server.local_addr()?);

    tokio::spawn(async move {
        while let Some(broadcast) = rx.recv().await {
            let session = session.clone();
            tokio::spawn(async move {
                match session.download_broadcast(&broadcast).await {
                    Ok(report) => info!(
                        from = %broadcast.from,
                        action = ?broadcast.action,
                        "downloaded {} bytes to {}",
                        report.bytes_written,
                        report.path.display()
                    ),
                    Err(e) => warn!(from = %broadcast.from, "broadcast download failed: {}", e),
                }
            });
        }
    });
    server.run().await?;
    Ok(())
}

fn inspect(torrent: &Path) -> Result<(), Box<dyn Error>> {
    let bytes = std::fs::read(torrent)?;
    let descriptor = TorrentDescriptor::from_bytes(&bytes)?;
    println!("Contents of {}:\n{}", torrent.display(), descriptor);
    Ok(())
}

async fn create(root: &Path, file: &Path, piece_length: u64, output: Option<PathBuf>, seed: bool) -> Result<(), Box<dyn Error>> {
    let data = tokio::fs::read(file).await?;
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("{} has no usable file name", file.display()))?;
    let descriptor = TorrentDescriptor::from_content(name, &data, piece_length)?;

    let output = output.unwrap_or_else(|| file.with_extension("torrent"));
    tokio::fs::write(&output, descriptor.to_torrent_bytes()).await?;
    println!("Wrote {}:\n{}", output.display(), descriptor);

    if seed {
        let store = PieceStore::new(root, &descriptor.info_hash);
        store.seed(&descriptor, &data).await?;
        println!("Seeded {} pieces into {}", descriptor.num_pieces(), store.dir().display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _guard = init_logging(args.stderr);

    let mut config = Config { root: args.root.clone(), ..Config::default() };
    let result = match args.command {
        Command::Download { torrent, peers, keep_pieces } => {
            config.keep_piece_files = keep_pieces;
            download(config, &torrent, peers).await
        },
        Command::Serve { listen, peers } => {
            config.listen = listen;
            serve(config, peers).await
        },
        Command::Inspect { torrent } => inspect(&torrent),
        Command::Create { file, piece_length, output, seed } => create(&args.root, &file, piece_length, output, seed).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("{e}");
            ExitCode::FAILURE
        },
    }
}
