//! Torrent file parsing.
//!
//! Single-file `.torrent` metadata extraction using bencode-rs, with the
//! info hash computed over the raw bytes of the `info` dictionary.

pub mod bencode;
pub mod types;

use std::path::Path;

use async_trait::async_trait;
pub use types::{TorrentDescriptor, TorrentParser};

use self::bencode::BencodeParser;
use super::TorrentError;

/// Parser for `.torrent` files backed by bencode-rs.
#[derive(Debug, Default)]
pub struct BencodeTorrentParser;

impl BencodeTorrentParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TorrentParser for BencodeTorrentParser {
    async fn parse_torrent_data(
        &self,
        torrent_bytes: &[u8],
    ) -> Result<TorrentDescriptor, TorrentError> {
        BencodeParser::parse_bencode_data(torrent_bytes)
    }

    async fn parse_torrent_file(&self, path: &Path) -> Result<TorrentDescriptor, TorrentError> {
        let file_contents =
            tokio::fs::read(path)
                .await
                .map_err(|e| TorrentError::InvalidTorrentFile {
                    reason: format!("Cannot read {}: {e}", path.display()),
                })?;

        self.parse_torrent_data(&file_contents).await
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::torrent::PieceIndex;

    fn info_dict(length: u64, piece_length: u32, pieces: &[u8]) -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{length}e").as_bytes());
        info.extend_from_slice(b"4:name8:data.bin");
        info.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        info.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        info.extend_from_slice(pieces);
        info.push(b'e');
        info
    }

    fn torrent_bytes(info: &[u8]) -> Vec<u8> {
        let mut torrent = Vec::new();
        let announce = "http://tracker.test/announce";
        torrent.extend_from_slice(format!("d8:announce{}:{announce}", announce.len()).as_bytes());
        // A decoy entry whose value mentions the info key
        torrent.extend_from_slice(b"7:comment6:4:info");
        torrent.extend_from_slice(b"4:info");
        torrent.extend_from_slice(info);
        torrent.push(b'e');
        torrent
    }

    #[tokio::test]
    async fn test_single_file_torrent_parsing() {
        let pieces = [[0xAAu8; 20], [0xBBu8; 20]].concat();
        let info = info_dict(40_000, 32_768, &pieces);
        let torrent = torrent_bytes(&info);

        let descriptor = BencodeTorrentParser::new()
            .parse_torrent_data(&torrent)
            .await
            .unwrap();

        assert_eq!(descriptor.announce, "http://tracker.test/announce");
        assert_eq!(descriptor.name, "data.bin");
        assert_eq!(descriptor.piece_count(), 2);
        assert_eq!(descriptor.piece_size(PieceIndex::new(0)), 32_768);
        assert_eq!(descriptor.piece_size(PieceIndex::new(1)), 40_000 - 32_768);
        assert_eq!(descriptor.piece_offset(PieceIndex::new(1)), 32_768);

        let expected: [u8; 20] = Sha1::digest(&info).into();
        assert_eq!(descriptor.info_hash.as_bytes(), &expected);
    }

    #[tokio::test]
    async fn test_multi_file_torrent_rejected() {
        let torrent = b"d8:announce3:url4:infod5:filesld6:lengthi1e4:pathl1:aeee4:name1:x12:piece lengthi1e6:pieces0:ee";

        let result = BencodeTorrentParser::new().parse_torrent_data(torrent).await;

        assert!(matches!(
            result,
            Err(TorrentError::InvalidTorrentFile { reason }) if reason.contains("Multi-file")
        ));
    }

    #[tokio::test]
    async fn test_piece_count_mismatch_rejected() {
        let info = info_dict(100_000, 32_768, &[0u8; 20]);
        let result = BencodeTorrentParser::new()
            .parse_torrent_data(&torrent_bytes(&info))
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_file_is_invalid_torrent() {
        let result = BencodeTorrentParser::new()
            .parse_torrent_file(Path::new("/nonexistent/file.torrent"))
            .await;

        assert!(matches!(
            result,
            Err(TorrentError::InvalidTorrentFile { .. })
        ));
    }

    #[test]
    fn test_resume_path_appends_suffix() {
        let descriptor = TorrentDescriptor::new(
            "http://t/announce".to_string(),
            crate::torrent::InfoHash::new([0u8; 20]),
            "movie.mkv".to_string(),
            16_384,
            16_384,
            vec![[0u8; 20]],
        )
        .with_output_dir(Path::new("/downloads"));

        assert_eq!(
            descriptor.resume_path("-config.txt"),
            Path::new("/downloads/movie.mkv-config.txt")
        );
    }

    #[test]
    fn test_value_end_walks_nested_containers() {
        let data = b"d1:ald1:bi3eee1:ci-7ee";
        assert_eq!(BencodeParser::value_end(data, 0).unwrap(), data.len());
        assert!(BencodeParser::value_end(b"l4:abc", 0).is_err());
    }
}
