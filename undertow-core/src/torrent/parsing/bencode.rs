//! Bencode decoding of single-file torrents and info hash calculation

use sha1::{Digest, Sha1};

use super::types::TorrentDescriptor;
use crate::torrent::{InfoHash, TorrentError};

pub(super) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Bencode parsing utilities for torrent descriptor extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Parse bencode data into a descriptor.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing or field extraction failed
    pub fn parse_bencode_data(torrent_bytes: &[u8]) -> ParseResult<TorrentDescriptor> {
        let parsed = bencode_rs::Value::parse(torrent_bytes).map_err(|e| {
            TorrentError::InvalidTorrentFile {
                reason: format!("Bencode parsing failed: {e:?}"),
            }
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Root element must be dictionary".to_string(),
            });
        };

        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Missing or invalid 'info' dictionary".to_string(),
            });
        };

        if info.contains_key(b"files".as_slice()) {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Multi-file torrents are not supported".to_string(),
            });
        }

        let announce = Self::extract_bytes_as_string(dict, b"announce")?;
        let name = Self::extract_bytes_as_string(info, b"name")?;
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!("Unsafe file name: {name:?}"),
            });
        }

        let piece_length = Self::extract_integer(info, b"piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|length| *length > 0)
            .ok_or_else(|| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid piece length: {piece_length}"),
            })?;

        let total_length = Self::extract_integer(info, b"length")?;
        let total_length =
            u64::try_from(total_length).map_err(|_| TorrentError::InvalidTorrentFile {
                reason: format!("Invalid length: {total_length}"),
            })?;

        let pieces = Self::extract_bytes(info, b"pieces")?;
        if pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: "Invalid pieces length".to_string(),
            });
        }
        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Expected {} piece hashes for {} bytes, found {}",
                    expected_pieces,
                    total_length,
                    piece_hashes.len()
                ),
            });
        }

        let info_hash = Self::calculate_info_hash(torrent_bytes)?;

        Ok(TorrentDescriptor::new(
            announce,
            info_hash,
            name,
            piece_length,
            total_length,
            piece_hashes,
        ))
    }

    /// SHA-1 over the raw bytes of the top-level `info` value.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the top-level dictionary has no `info` entry
    pub fn calculate_info_hash(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
        let (start, end) = Self::info_span(torrent_bytes)?;
        let digest: [u8; 20] = Sha1::digest(&torrent_bytes[start..end]).into();
        Ok(InfoHash::new(digest))
    }

    // Walks the top-level dictionary key by key so a nested "4:info" string
    // is never mistaken for the entry.
    fn info_span(data: &[u8]) -> ParseResult<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }
        let mut pos = 1;
        while data.get(pos) != Some(&b'e') {
            let (key, key_end) = Self::string_at(data, pos)?;
            let value_end = Self::value_end(data, key_end)?;
            if key == b"info" {
                return Ok((key_end, value_end));
            }
            pos = value_end;
        }
        Err(invalid("Could not find info dictionary in data"))
    }

    /// Payload of the byte string at `pos` and the position just past it.
    fn string_at(data: &[u8], pos: usize) -> ParseResult<(&[u8], usize)> {
        let colon = data[pos..]
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| invalid("Invalid string format"))?
            + pos;
        let length: usize = std::str::from_utf8(&data[pos..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("Invalid string length"))?;
        let end = colon + 1 + length;
        let payload = data
            .get(colon + 1..end)
            .ok_or_else(|| invalid("String runs past end of data"))?;
        Ok((payload, end))
    }

    /// Position just past the bencode value starting at `pos`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is malformed or truncated
    pub fn value_end(data: &[u8], pos: usize) -> ParseResult<usize> {
        match data.get(pos) {
            Some(b'i') => {
                let end = data[pos..]
                    .iter()
                    .position(|b| *b == b'e')
                    .ok_or_else(|| invalid("Unterminated integer"))?;
                Ok(pos + end + 1)
            }
            Some(b'l' | b'd') => {
                let mut cursor = pos + 1;
                while data.get(cursor) != Some(&b'e') {
                    if cursor >= data.len() {
                        return Err(invalid("Incomplete bencode container"));
                    }
                    cursor = Self::value_end(data, cursor)?;
                }
                Ok(cursor + 1)
            }
            Some(b'0'..=b'9') => Self::string_at(data, pos).map(|(_, end)| end),
            _ => Err(invalid("Invalid bencode character")),
        }
    }

    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidTorrentFile {
            reason: format!("Invalid UTF-8 in field: {:?}", String::from_utf8_lossy(key)),
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(TorrentError::InvalidTorrentFile {
                reason: format!(
                    "Missing or invalid integer field: {:?}",
                    String::from_utf8_lossy(key)
                ),
            }),
        }
    }
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}
