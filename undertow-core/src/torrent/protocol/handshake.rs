//! BitTorrent handshake serialization and deserialization

use super::types::{PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Protocol name literal carried by every handshake.
pub const PROTOCOL_NAME: &str = "BitTorrent protocol";

/// Size of a handshake: length byte, name, reserved, info hash and peer id.
pub const HANDSHAKE_LENGTH: usize = 1 + PROTOCOL_NAME.len() + 8 + 20 + 20;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LENGTH);
        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// True if `data` opens with the fixed handshake prefix.
    ///
    /// Used to tell a handshake apart from a length-prefixed frame, which
    /// would never start with byte 19 followed by the protocol name.
    pub fn looks_like_handshake(data: &[u8]) -> bool {
        data.len() >= 1 + PROTOCOL_NAME.len()
            && data[0] as usize == PROTOCOL_NAME.len()
            && &data[1..1 + PROTOCOL_NAME.len()] == PROTOCOL_NAME.as_bytes()
    }

    /// Deserializes a 68-byte handshake following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Wrong length or protocol name
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() != HANDSHAKE_LENGTH {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Handshake must be {HANDSHAKE_LENGTH} bytes, got {}",
                    data.len()
                ),
            });
        }
        if !Self::looks_like_handshake(data) {
            return Err(TorrentError::ProtocolError {
                message: "Unsupported protocol in handshake".to_string(),
            });
        }

        let body = &data[1 + PROTOCOL_NAME.len()..];

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&body[..8]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&body[8..28]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&body[28..48]);

        Ok(PeerHandshake {
            protocol: PROTOCOL_NAME.to_string(),
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }

    /// Deserializes and checks the handshake is for `expected`.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Malformed handshake
    /// - `TorrentError::HandshakeMismatch` - Info hash differs from `expected`
    pub fn validate(data: &[u8], expected: &InfoHash) -> Result<PeerHandshake, TorrentError> {
        let handshake = Self::deserialize_handshake(data)?;
        if handshake.info_hash != *expected {
            return Err(TorrentError::HandshakeMismatch);
        }
        Ok(handshake)
    }
}
