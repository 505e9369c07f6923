use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::metadata::descriptor::TorrentDescriptor;
use crate::util;

/// File name under which a received descriptor is kept next to its pieces.
pub const DESCRIPTOR_FILE: &str = "torrentfile";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no stored content at {0}")]
    MissingContent(PathBuf),
    #[error("`{0}` cannot be used as a file name")]
    InvalidName(String),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io { path: path.to_path_buf(), source }
}

/// The directory `<root>/<hex info hash>/` for one content: piece files named
/// by decimal index, the assembled file, and the stored descriptor.
#[derive(Debug, Clone)]
pub struct PieceStore {
    dir: PathBuf,
}

impl PieceStore {
    pub fn new(root: &Path, info_hash: &[u8; 20]) -> Self {
        PieceStore { dir: root.join(util::to_string(info_hash)) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn piece_path(&self, index: u32) -> PathBuf {
        self.dir.join(index.to_string())
    }

    /// Where the assembled file goes. The name must be a single path
    /// component and must not shadow a piece file or the stored descriptor.
    pub fn output_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let path = Path::new(name);
        let reserved = name.parse::<u32>().is_ok() || name == DESCRIPTOR_FILE;
        match path.file_name() {
            Some(file_name) if file_name == path.as_os_str() && !reserved => Ok(self.dir.join(file_name)),
            _ => Err(StorageError::InvalidName(name.to_owned())),
        }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await.map_err(io_error(&self.dir))
    }

    /// Creates the assembled file at its final size so pieces can be written
    /// at their offsets in any order.
    pub async fn create_output(&self, name: &str, length: u64) -> Result<OutputFile, StorageError> {
        let path = self.output_path(name)?;
        self.ensure_dir().await?;
        let file = File::create(&path).await.map_err(io_error(&path))?;
        file.set_len(length).await.map_err(io_error(&path))?;
        Ok(OutputFile { path, file })
    }

    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_dir().await?;
        let path = self.piece_path(index);
        fs::write(&path, data).await.map_err(io_error(&path))
    }

    pub async fn write_descriptor(&self, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        self.ensure_dir().await?;
        let path = self.dir.join(DESCRIPTOR_FILE);
        fs::write(&path, bytes).await.map_err(io_error(&path))?;
        Ok(path)
    }

    /// Splits `data` into piece files and stores the descriptor beside them.
    pub async fn seed(&self, descriptor: &TorrentDescriptor, data: &[u8]) -> Result<(), StorageError> {
        for index in 0..descriptor.num_pieces() {
            let (begin, end) = descriptor.piece_bounds(index);
            self.write_piece(index as u32, &data[begin as usize..end as usize]).await?;
        }
        self.write_descriptor(&descriptor.to_torrent_bytes()).await?;
        Ok(())
    }

    /// Indices of the stored piece files, in ascending order. Entries whose
    /// names are not decimal indices (the assembled file, the descriptor) are
    /// skipped.
    pub async fn stored_indices(&self) -> Result<Vec<u32>, StorageError> {
        if !fs::try_exists(&self.dir).await.map_err(io_error(&self.dir))? {
            return Err(StorageError::MissingContent(self.dir.clone()));
        }
        let mut indices = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_error(&self.dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&self.dir))? {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                debug!(file = ?name, "skipping non-piece file");
                continue;
            };
            if entry.file_type().await.map_err(io_error(&entry.path()))?.is_file() {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>, StorageError> {
        let path = self.piece_path(index);
        fs::read(&path).await.map_err(io_error(&path))
    }

    /// Every stored piece keyed by index.
    pub async fn load_pieces(&self) -> Result<BTreeMap<u32, Vec<u8>>, StorageError> {
        let mut pieces = BTreeMap::new();
        for index in self.stored_indices().await? {
            pieces.insert(index, self.read_piece(index).await?);
        }
        Ok(pieces)
    }
}

/// The assembled output, written only by the download collector.
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    file: File,
}

impl OutputFile {
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.file.seek(SeekFrom::Start(offset)).await.map_err(io_error(&self.path))?;
        self.file.write_all(data).await.map_err(io_error(&self.path))
    }

    pub async fn finish(mut self) -> Result<PathBuf, StorageError> {
        self.file.flush().await.map_err(io_error(&self.path))?;
        self.file.sync_all().await.map_err(io_error(&self.path))?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn seeded_pieces_load_back_by_index() {
        let tmp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let descriptor = TorrentDescriptor::from_content("data.bin", &data, 300).unwrap();
        let store = PieceStore::new(tmp.path(), &descriptor.info_hash);
        store.seed(&descriptor, &data).await.unwrap();
        store.create_output("data.bin", 1000).await.unwrap();

        let pieces = store.load_pieces().await.unwrap();
        assert_eq!(pieces.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(pieces[&3], data[900..]);
        assert!(store.dir().join(DESCRIPTOR_FILE).exists());
    }

    #[tokio::test]
    async fn missing_content_directory_is_reported() {
        let tmp = TempDir::new().unwrap();
        let store = PieceStore::new(tmp.path(), &[1; 20]);
        assert!(matches!(store.load_pieces().await, Err(StorageError::MissingContent(_))));
    }

    #[tokio::test]
    async fn output_is_presized_and_written_at_offsets() {
        let tmp = TempDir::new().unwrap();
        let store = PieceStore::new(tmp.path(), &[2; 20]);
        let mut output = store.create_output("out", 6).await.unwrap();
        output.write_at(4, b"ef").await.unwrap();
        output.write_at(0, b"ab").await.unwrap();
        let path = output.finish().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"ab\0\0ef");
    }

    #[test]
    fn output_names_cannot_escape_the_content_directory() {
        let store = PieceStore::new(Path::new("/tmp/root"), &[3; 20]);
        assert!(store.output_path("file.iso").is_ok());
        assert!(matches!(store.output_path("../escape"), Err(StorageError::InvalidName(_))));
        assert!(matches!(store.output_path("a/b"), Err(StorageError::InvalidName(_))));
        assert!(matches!(store.output_path(""), Err(StorageError::InvalidName(_))));
    }

    #[test]
    fn output_names_cannot_shadow_pieces_or_the_descriptor() {
        let store = PieceStore::new(Path::new("/tmp/root"), &[3; 20]);
        assert!(matches!(store.output_path("1"), Err(StorageError::InvalidName(_))));
        assert!(matches!(store.output_path("0042"), Err(StorageError::InvalidName(_))));
        assert!(matches!(store.output_path(DESCRIPTOR_FILE), Err(StorageError::InvalidName(_))));
        assert!(store.output_path("1.iso").is_ok());
        assert!(store.output_path("-1").is_ok());
    }

    #[tokio::test]
    async fn indices_are_listed_without_reading_pieces() {
        let tmp = TempDir::new().unwrap();
        let store = PieceStore::new(tmp.path(), &[4; 20]);
        store.write_piece(7, b"seven").await.unwrap();
        store.write_piece(2, b"two").await.unwrap();
        store.write_descriptor(b"de").await.unwrap();
        assert_eq!(store.stored_indices().await.unwrap(), vec![2, 7]);
        assert_eq!(store.read_piece(7).await.unwrap(), b"seven");
        assert!(matches!(store.read_piece(3).await, Err(StorageError::Io { .. })));
    }
}
