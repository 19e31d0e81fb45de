//! Decoded torrent descriptor and the parser capability

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::super::{InfoHash, PieceIndex, TorrentError};

/// Everything the download needs from a single-file `.torrent`.
///
/// Immutable once loaded. `output_path` starts out as the bare file name and
/// is anchored in a download directory with [`TorrentDescriptor::with_output_dir`].
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentDescriptor {
    pub announce: String,
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub output_path: PathBuf,
}

impl TorrentDescriptor {
    pub fn new(
        announce: String,
        info_hash: InfoHash,
        name: String,
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Self {
        let output_path = PathBuf::from(&name);
        Self {
            announce,
            info_hash,
            name,
            piece_length,
            total_length,
            piece_hashes,
            output_path,
        }
    }

    /// Places the output file inside `dir`.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_path = dir.join(&self.name);
        self
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`; only the last piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let offset = self.piece_offset(index);
        let remaining = self.total_length.saturating_sub(offset);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    /// Byte offset of piece `index` within the output file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }

    /// Resume side file: the output path with `suffix` appended.
    pub fn resume_path(&self, suffix: &str) -> PathBuf {
        let mut path = self.output_path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }
}

/// Abstract torrent parsing interface.
#[async_trait]
pub trait TorrentParser: Send + Sync {
    /// Parses a descriptor from raw bencode bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode, missing fields or a multi-file torrent
    async fn parse_torrent_data(&self, data: &[u8]) -> Result<TorrentDescriptor, TorrentError>;

    /// Reads a `.torrent` file from disk and parses it.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - File cannot be read or fails to parse
    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError>;
}
