//! BitTorrent peer-wire download: protocol, piece store, selection and sessions

pub mod downloader;
pub mod engine;
pub mod parsing;
pub mod peer_directory;
pub mod peer_server;
pub mod peer_session;
pub mod piece_picker;
pub mod pieces;
pub mod protocol;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use downloader::{DownloadCoordinator, DownloadSummary};
pub use engine::{EngineHandle, TorrentEngine};
pub use parsing::{TorrentDescriptor, TorrentParser};
pub use peer_directory::{ConnectionStatus, PeerDirection, PeerDirectory, PeerRecord};
pub use peer_server::PeerServer;
pub use peer_session::{InterestState, PeerSession, SessionContext, SessionEnd};
pub use piece_picker::{PiecePicker, SelectionKind, SelectionStrategy};
pub use pieces::{Bitfield, BlockRequest, BlockState, CompletionEvents, PieceStore};
pub use protocol::{PeerConnection, PeerHandshake, PeerId, PeerMessage};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
};

use crate::storage::StorageError;

/// Size of a block, the unit of a REQUEST/PIECE exchange.
///
/// The final block of a piece may be shorter.
pub const BLOCK_SIZE: u32 = 16_384;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a `usize` for slice addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Protocol and I/O variants abort the affected connection only. Hash
/// mismatches are never reported through this type; verification reports
/// `false` and the piece is downloaded again.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker returned failure: {reason}")]
    TrackerFailure { reason: String },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Unknown message id {id}")]
    UnknownMessageId { id: u8 },

    #[error("Handshake info hash does not match this torrent")]
    HandshakeMismatch,

    #[error("Timed out waiting for handshake from {address}")]
    HandshakeTimeout { address: SocketAddr },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Piece {index} is out of range")]
    PieceOutOfRange { index: PieceIndex },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}
