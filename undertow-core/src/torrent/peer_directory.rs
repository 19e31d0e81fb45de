//! Registry of live peer connections.
//!
//! One record per remote address, shared by outbound sessions, the listening
//! server and the coordinator. Records are created on connect and dropped on
//! disconnect.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use parking_lot::Mutex;

use super::peer_session::InterestState;
use super::protocol::{MessageKind, PeerId};

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    Inbound,
    Outbound,
}

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Handshaking,
    Connected,
}

/// Everything known about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub direction: PeerDirection,
    pub status: ConnectionStatus,
    pub peer_id: Option<PeerId>,
    /// Number of pieces the remote claims to hold
    pub remote_pieces: u32,
    pub interest: InterestState,
    /// Message kinds received so far, for consistency checks
    pub history: HashSet<MessageKind>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub completed: bool,
    pub connected_at: Instant,
}

impl PeerRecord {
    pub fn new(address: SocketAddr, direction: PeerDirection) -> Self {
        Self {
            address,
            direction,
            status: ConnectionStatus::Connecting,
            peer_id: None,
            remote_pieces: 0,
            interest: InterestState::default(),
            history: HashSet::new(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            completed: false,
            connected_at: Instant::now(),
        }
    }
}

/// Synchronized map of live peers keyed by remote address.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Mutex<HashMap<SocketAddr, PeerRecord>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record. Returns false if `address` is already present.
    pub fn register(&self, address: SocketAddr, direction: PeerDirection) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains_key(&address) {
            return false;
        }
        peers.insert(address, PeerRecord::new(address, direction));
        true
    }

    pub fn remove(&self, address: SocketAddr) -> Option<PeerRecord> {
        self.peers.lock().remove(&address)
    }

    pub fn contains(&self, address: SocketAddr) -> bool {
        self.peers.lock().contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Applies `update` to the record for `address`, if present.
    pub fn update_state(&self, address: SocketAddr, update: impl FnOnce(&mut PeerRecord)) {
        if let Some(record) = self.peers.lock().get_mut(&address) {
            update(record);
        }
    }

    pub fn set_peer_id(&self, address: SocketAddr, peer_id: PeerId) {
        self.update_state(address, |record| {
            record.peer_id = Some(peer_id);
            record.status = ConnectionStatus::Connected;
        });
    }

    pub fn record_message(&self, address: SocketAddr, kind: MessageKind) {
        self.update_state(address, |record| {
            record.history.insert(kind);
        });
    }

    /// Whether `address` has sent a message of `kind` since its history was last cleared.
    pub fn has_received(&self, address: SocketAddr, kind: MessageKind) -> bool {
        self.peers
            .lock()
            .get(&address)
            .is_some_and(|record| record.history.contains(&kind))
    }

    pub fn clear_history(&self, address: SocketAddr) {
        self.update_state(address, |record| record.history.clear());
    }

    /// Flags every record completed once the download is done.
    pub fn mark_all_completed(&self) {
        for record in self.peers.lock().values_mut() {
            record.completed = true;
        }
    }

    /// Copies of every record, ordered by address.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut records: Vec<_> = self.peers.lock().values().cloned().collect();
        records.sort_by_key(|record| record.address);
        records
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|record| record.status == ConnectionStatus::Connected)
            .count()
    }
}
