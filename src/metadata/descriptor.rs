use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::metadata::bencode::{BencodeError, BencodeValue};
use crate::util::{self, sha1_hash};

/// Everything the piece-exchange engine needs to know about one shared file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: u64,
    pub total_length: u64,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("descriptor is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("descriptor is not a bencoded dictionary")]
    FileIsNotDictionary,
    #[error("required key `{0}` is missing")]
    MissingRequiredKey(&'static str),
    #[error("key `{0}` does not map to a byte string")]
    KeyDoesNotMapToString(&'static str),
    #[error("key `{0}` does not map to an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("key `{0}` does not map to a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("key `{key}` holds negative integer {value}")]
    NegativeInteger { key: &'static str, value: i64 },
    #[error("pieces string length {0} is not a multiple of 20")]
    InvalidPiecesLength(usize),
    #[error("piece length must be positive")]
    ZeroPieceLength,
    #[error("{total_length} bytes in pieces of {piece_length} need {expected} hashes, found {actual}")]
    PieceCountMismatch { total_length: u64, piece_length: u64, expected: u64, actual: usize },
    #[error("multi-file descriptors are not supported")]
    MultipleFilesUnsupported,
}

type Result<T> = std::result::Result<T, DescriptorError>;

const INFO: &[u8] = b"info";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const NAME: &[u8] = b"name";
const LENGTH: &[u8] = b"length";
const FILES: &[u8] = b"files";

impl fmt::Display for TorrentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "name: {}", self.name)?;
        writeln!(f, "info hash: {}", util::to_string(&self.info_hash))?;
        writeln!(f, "size: {} bytes ({} pieces of {} bytes each)", self.total_length, self.num_pieces(), self.piece_length)
    }
}

impl TorrentDescriptor {
    pub fn new(
        info_hash: [u8; 20],
        piece_hashes: Vec<[u8; 20]>,
        piece_length: u64,
        total_length: u64,
        name: String,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(DescriptorError::ZeroPieceLength);
        }
        let expected = total_length.div_ceil(piece_length);
        if expected != piece_hashes.len() as u64 {
            return Err(DescriptorError::PieceCountMismatch {
                total_length,
                piece_length,
                expected,
                actual: piece_hashes.len(),
            });
        }
        Ok(TorrentDescriptor { info_hash, piece_hashes, piece_length, total_length, name })
    }

    /// Builds the descriptor a seeder would publish for `data`.
    pub fn from_content(name: &str, data: &[u8], piece_length: u64) -> Result<Self> {
        if piece_length == 0 {
            return Err(DescriptorError::ZeroPieceLength);
        }
        let piece_hashes: Vec<[u8; 20]> = data.chunks(piece_length as usize).map(sha1_hash).collect();
        let info = Self::info_dictionary(name, &piece_hashes, piece_length, data.len() as u64);
        let info_hash = sha1_hash(&Vec::from(&info));
        Self::new(info_hash, piece_hashes, piece_length, data.len() as u64, name.to_owned())
    }

    /// Parses the bencoded `.torrent` form. The info hash is taken over the
    /// canonical re-encoding of the `info` dictionary.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = BencodeValue::try_from(bytes)?;
        let BencodeValue::Dictionary(items) = &value else {
            return Err(DescriptorError::FileIsNotDictionary);
        };
        let info = items.get(INFO).ok_or(DescriptorError::MissingRequiredKey("info"))?;
        let BencodeValue::Dictionary(info_items) = info else {
            return Err(DescriptorError::KeyDoesNotMapToDictionary("info"));
        };
        if info_items.contains_key(FILES) {
            return Err(DescriptorError::MultipleFilesUnsupported);
        }

        let piece_length = extract_uint(info_items.get(PIECE_LENGTH), "piece length")?;
        let total_length = extract_uint(info_items.get(LENGTH), "length")?;
        let name = extract_string(info_items.get(NAME), "name")?;
        let piece_hashes = extract_pieces(info_items.get(PIECES))?;
        let info_hash = sha1_hash(&Vec::from(info));

        Self::new(info_hash, piece_hashes, piece_length, total_length, name)
    }

    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        let info = Self::info_dictionary(&self.name, &self.piece_hashes, self.piece_length, self.total_length);
        let mut items = BTreeMap::new();
        items.insert(INFO.to_vec(), info);
        Vec::from(&BencodeValue::Dictionary(items))
    }

    fn info_dictionary(name: &str, piece_hashes: &[[u8; 20]], piece_length: u64, total_length: u64) -> BencodeValue {
        let mut items = BTreeMap::new();
        items.insert(LENGTH.to_vec(), BencodeValue::Integer(total_length as i64));
        items.insert(NAME.to_vec(), BencodeValue::bytes(name.as_bytes()));
        items.insert(PIECE_LENGTH.to_vec(), BencodeValue::Integer(piece_length as i64));
        items.insert(PIECES.to_vec(), BencodeValue::ByteString(piece_hashes.concat()));
        BencodeValue::Dictionary(items)
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` that piece `index` occupies in the assembled file.
    pub fn piece_bounds(&self, index: usize) -> (u64, u64) {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (begin, end)
    }

    pub fn piece_size(&self, index: usize) -> u64 {
        let (begin, end) = self.piece_bounds(index);
        end - begin
    }
}

fn extract_string(value: Option<&BencodeValue>, name: &'static str) -> Result<String> {
    match value {
        Some(BencodeValue::ByteString(text)) => {
            std::str::from_utf8(text).map(str::to_owned).map_err(|_| DescriptorError::KeyDoesNotMapToString(name))
        },
        Some(_) => Err(DescriptorError::KeyDoesNotMapToString(name)),
        None => Err(DescriptorError::MissingRequiredKey(name)),
    }
}

fn extract_uint(value: Option<&BencodeValue>, name: &'static str) -> Result<u64> {
    match value {
        Some(BencodeValue::Integer(num)) if *num < 0 => Err(DescriptorError::NegativeInteger { key: name, value: *num }),
        Some(BencodeValue::Integer(num)) => Ok(*num as u64),
        Some(_) => Err(DescriptorError::KeyDoesNotMapToInteger(name)),
        None => Err(DescriptorError::MissingRequiredKey(name)),
    }
}

fn extract_pieces(value: Option<&BencodeValue>) -> Result<Vec<[u8; 20]>> {
    match value {
        Some(BencodeValue::ByteString(s)) => {
            if s.len() % 20 != 0 {
                return Err(DescriptorError::InvalidPiecesLength(s.len()));
            }
            Ok(s.chunks_exact(20)
                .map(|chunk| {
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(chunk);
                    hash
                })
                .collect())
        },
        Some(_) => Err(DescriptorError::KeyDoesNotMapToString("pieces")),
        None => Err(DescriptorError::MissingRequiredKey("pieces")),
    }
}
