//! BitTorrent wire protocol.
//!
//! Message and handshake codecs following BEP 3 plus a framed connection
//! type shared by outbound sessions and tests.

pub mod connection;
pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use connection::{PeerConnection, ReadOutcome};
pub use handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
pub use messages::MessageCodec;
pub use types::{MessageKind, PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoHash;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-UT0001-");
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], b"-UT0001-");

        let peer_id2 = PeerId::generate("-UT0001-");
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));

        let serialized = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(serialized.len(), HANDSHAKE_LENGTH);
        assert_eq!(HANDSHAKE_LENGTH, 68);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], b"BitTorrent protocol");
        assert_eq!(&serialized[20..28], &[0u8; 8]);
        assert_eq!(&serialized[28..48], &[1u8; 20]);
        assert_eq!(&serialized[48..68], &[2u8; 20]);

        let deserialized = HandshakeCodec::deserialize_handshake(&serialized).unwrap();
        assert_eq!(handshake, deserialized);
    }

    #[test]
    fn test_handshake_detection() {
        let handshake = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::new([2u8; 20]));
        let serialized = HandshakeCodec::serialize_handshake(&handshake);
        assert!(HandshakeCodec::looks_like_handshake(&serialized));

        // A 68-byte PIECE frame is not a handshake
        let piece = MessageCodec::serialize_message(&PeerMessage::Piece {
            piece_index: crate::torrent::PieceIndex::new(0),
            offset: 0,
            data: bytes::Bytes::from(vec![0u8; 55]),
        });
        assert_eq!(piece.len(), HANDSHAKE_LENGTH);
        assert!(!HandshakeCodec::looks_like_handshake(&piece));
    }

    #[test]
    fn test_handshake_validation() {
        let ours = InfoHash::new([1u8; 20]);
        let theirs = PeerHandshake::new(InfoHash::new([3u8; 20]), PeerId::new([2u8; 20]));
        let serialized = HandshakeCodec::serialize_handshake(&theirs);

        assert!(matches!(
            HandshakeCodec::validate(&serialized, &ours),
            Err(crate::torrent::TorrentError::HandshakeMismatch)
        ));
        assert!(HandshakeCodec::deserialize_handshake(&serialized[..67]).is_err());
    }
}
