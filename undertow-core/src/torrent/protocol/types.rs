//! Core types for the BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes and sent to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID starting with `client_prefix`, padded with random bytes.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = &client_prefix.as_bytes()[..client_prefix.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);
        for byte in &mut id[prefix.len()..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// BitTorrent wire protocol messages.
///
/// The nine length-prefixed kinds of BEP 3. The handshake has no length
/// prefix and is modelled separately as [`PeerHandshake`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Zero-length frame that only keeps the connection open
    KeepAlive,
    /// Sender will not answer requests
    Choke,
    /// Sender will answer requests
    Unchoke,
    /// Sender wants pieces from the receiver
    Interested,
    /// Sender no longer wants pieces from the receiver
    NotInterested,
    /// Sender has acquired a piece
    Have {
        piece_index: PieceIndex,
    },
    /// Sender's complete availability bitmap
    Bitfield {
        bitfield: Bytes,
    },
    /// Ask for a block of data from a piece
    Request {
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        data: Bytes,
    },
    /// Withdraw a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
}

impl PeerMessage {
    /// Kind of this message, for receipt history.
    pub fn kind(&self) -> MessageKind {
        match self {
            PeerMessage::KeepAlive => MessageKind::KeepAlive,
            PeerMessage::Choke => MessageKind::Choke,
            PeerMessage::Unchoke => MessageKind::Unchoke,
            PeerMessage::Interested => MessageKind::Interested,
            PeerMessage::NotInterested => MessageKind::NotInterested,
            PeerMessage::Have { .. } => MessageKind::Have,
            PeerMessage::Bitfield { .. } => MessageKind::Bitfield,
            PeerMessage::Request { .. } => MessageKind::Request,
            PeerMessage::Piece { .. } => MessageKind::Piece,
            PeerMessage::Cancel { .. } => MessageKind::Cancel,
        }
    }
}

/// Message kinds, including the handshake, as tracked per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions, always zero when we send
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: super::handshake::PROTOCOL_NAME.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}
