//! Core types for tracker communication

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Lifecycle events reported to the tracker.
///
/// Periodic re-announces carry no event at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Download is starting
    Started,
    /// Every piece has been verified
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracker announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Port our listening server accepts peers on
    pub port: u16,
    /// Payload bytes served to other peers
    pub uploaded: u64,
    /// Payload bytes received from other peers
    pub downloaded: u64,
    /// Sum of the sizes of pieces not yet verified
    pub left: u64,
    /// None for periodic re-announces
    pub event: Option<AnnounceEvent>,
}

/// Tracker announce response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds the tracker asks us to wait between announces
    pub interval: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Announce capability the coordinator drives.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Reports our state to the tracker and returns its current peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` - Network or HTTP status failure
    /// - `TorrentError::TrackerFailure` - Tracker answered with a failure reason
    /// - `TorrentError::ProtocolError` - Response is not a valid announce reply
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Announce URL, for logging.
    fn tracker_url(&self) -> &str;
}
