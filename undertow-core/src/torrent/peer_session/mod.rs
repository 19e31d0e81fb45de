//! Outbound peer session.
//!
//! One task per remote address: handshake, learn what the peer holds,
//! declare interest, wait to be unchoked, then pull batches of blocks from
//! the picker until the peer has nothing left for us. Cancellation is
//! cooperative. The picker's stale flag and the shutdown signal are checked
//! between batches; a read in flight only ends on its own idle timeout.

pub mod state_machine;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub use state_machine::InterestState;

use super::peer_directory::{ConnectionStatus, PeerDirectory};
use super::piece_picker::PiecePicker;
use super::pieces::{Bitfield, BlockRequest, PieceStore};
use super::protocol::{
    MessageKind, PeerConnection, PeerHandshake, PeerId, PeerMessage, ReadOutcome,
};
use super::{InfoHash, TorrentError};
use crate::config::NetworkConfig;

/// Shared handles every session needs.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub store: Arc<PieceStore>,
    pub picker: Arc<PiecePicker>,
    pub directory: Arc<PeerDirectory>,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Whole pieces requested before reading responses
    pub pieces_per_batch: usize,
    pub network: NetworkConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer has nothing left we need, or the download is complete
    Finished,
    /// The peer holds no pieces at all
    NothingToOffer,
    /// We declared interest but were never unchoked
    NeverUnchoked,
    /// The remote closed the connection
    Closed,
    /// The engine is shutting down
    Shutdown,
}

/// Per-connection driver for an outbound peer.
#[derive(Debug)]
pub struct PeerSession<S = TcpStream> {
    connection: PeerConnection<S>,
    address: SocketAddr,
    context: SessionContext,
    state: InterestState,
    outstanding: HashSet<BlockRequest>,
    availability_known: bool,
    remote_pieces: u32,
    rounds: watch::Receiver<u64>,
    shutdown: watch::Receiver<bool>,
}

impl PeerSession<TcpStream> {
    /// Connects to `address` and drives the session to its end.
    ///
    /// The peer must already be registered with the picker and directory;
    /// it is unregistered from both before this returns, whatever the outcome.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connect, read or write failed
    /// - `TorrentError::HandshakeTimeout` / `TorrentError::HandshakeMismatch` - Handshake failed
    /// - `TorrentError::ProtocolError` / `TorrentError::UnknownMessageId` - Peer sent garbage
    pub async fn run(address: SocketAddr, context: SessionContext) -> Result<SessionEnd, TorrentError> {
        context
            .directory
            .update_state(address, |record| record.status = ConnectionStatus::Connecting);

        match PeerConnection::connect(address, context.network.connect_timeout).await {
            Ok(connection) => Self::run_on(connection, context).await,
            Err(e) => {
                unregister(&context, address);
                Err(e)
            }
        }
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Drives a session over an already open stream, then unregisters the peer.
    ///
    /// # Errors
    /// See [`PeerSession::run`].
    pub async fn run_on(
        connection: PeerConnection<S>,
        context: SessionContext,
    ) -> Result<SessionEnd, TorrentError> {
        let address = connection.address();
        let session = Self::new(connection, context.clone());
        let result = session.drive().await;

        match &result {
            Ok(end) => tracing::info!("Session with {} ended: {:?}", address, end),
            Err(e) => tracing::warn!("Session with {} aborted: {}", address, e),
        }
        unregister(&context, address);
        result
    }

    fn new(connection: PeerConnection<S>, context: SessionContext) -> Self {
        let rounds = context.picker.subscribe_rounds();
        let shutdown = context.shutdown.clone();
        Self {
            address: connection.address(),
            connection,
            context,
            state: InterestState::default(),
            outstanding: HashSet::new(),
            availability_known: false,
            remote_pieces: 0,
            rounds,
            shutdown,
        }
    }

    async fn drive(mut self) -> Result<SessionEnd, TorrentError> {
        self.handshake().await?;

        if !self.receive_availability().await? {
            return Ok(SessionEnd::Closed);
        }
        self.context.picker.mark_bitfield_received(self.address);

        if self.remote_pieces == 0 {
            self.connection.shutdown().await;
            return Ok(SessionEnd::NothingToOffer);
        }

        if self.state.send_interested() {
            self.connection.send(&PeerMessage::Interested).await?;
            self.publish_state();
        }

        let end = if self.state.awaits_unchoke() && !self.await_unchoke().await? {
            SessionEnd::NeverUnchoked
        } else {
            self.request_loop().await?
        };

        if end != SessionEnd::Closed && self.state.send_not_interested() {
            self.connection.send(&PeerMessage::NotInterested).await?;
            self.publish_state();
        }
        self.connection.shutdown().await;
        Ok(end)
    }

    async fn handshake(&mut self) -> Result<(), TorrentError> {
        self.context
            .directory
            .update_state(self.address, |record| record.status = ConnectionStatus::Handshaking);

        let ours = PeerHandshake::new(self.context.info_hash, self.context.peer_id);
        self.connection.send_handshake(&ours).await?;
        let theirs = self
            .connection
            .receive_handshake(&self.context.info_hash, self.context.network.handshake_timeout)
            .await?;

        self.context
            .directory
            .set_peer_id(self.address, theirs.peer_id);
        self.context
            .directory
            .record_message(self.address, MessageKind::Handshake);
        tracing::info!("Handshake with {} ({})", self.address, theirs.peer_id);
        Ok(())
    }

    /// Reads until the peer has told us what it holds or goes quiet.
    ///
    /// Returns false if the connection closed.
    async fn receive_availability(&mut self) -> Result<bool, TorrentError> {
        while !self.availability_known {
            match self
                .connection
                .read_batch(self.context.network.read_idle_timeout)
                .await?
            {
                ReadOutcome::Messages(messages) => self.handle_all(messages)?,
                // A peer with nothing sends no bitfield
                ReadOutcome::Idle => break,
                ReadOutcome::Closed => return Ok(false),
            }
        }
        Ok(true)
    }

    /// One receive cycle waiting for UNCHOKE. Returns false if it never came.
    async fn await_unchoke(&mut self) -> Result<bool, TorrentError> {
        while self.state.is_choked() {
            match self
                .connection
                .read_batch(self.context.network.read_idle_timeout)
                .await?
            {
                ReadOutcome::Messages(messages) => self.handle_all(messages)?,
                ReadOutcome::Idle | ReadOutcome::Closed => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn request_loop(&mut self) -> Result<SessionEnd, TorrentError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }
            if self.context.store.is_complete() || self.context.picker.is_finished(self.address) {
                return Ok(SessionEnd::Finished);
            }
            if self.context.picker.take_stale(self.address) {
                // Superseded batch: forget what we were waiting for
                self.outstanding.clear();
            }
            if self.state.is_choked() && !self.await_unchoke().await? {
                return Ok(SessionEnd::NeverUnchoked);
            }
            if !self.state.can_request() {
                return Ok(SessionEnd::Finished);
            }

            let batch = self
                .context
                .picker
                .next_batch(self.address, self.context.pieces_per_batch);
            if batch.is_empty() {
                self.wait_for_round().await;
                continue;
            }

            let mut requests = Vec::new();
            for block in batch.iter().flat_map(|assignment| assignment.blocks.iter()) {
                // Full blocks arrived through another peer since selection
                if self.context.store.mark_pending(block) && self.outstanding.insert(*block) {
                    requests.push(block.to_message());
                }
            }
            tracing::debug!(
                "Requesting {} blocks over {} pieces from {}",
                requests.len(),
                batch.len(),
                self.address
            );
            self.connection.send_all(&requests).await?;

            while !self.outstanding.is_empty() {
                match self
                    .connection
                    .read_batch(self.context.network.read_idle_timeout)
                    .await?
                {
                    ReadOutcome::Messages(messages) => self.handle_all(messages)?,
                    ReadOutcome::Idle => {
                        tracing::debug!(
                            "{} idle with {} blocks outstanding",
                            self.address,
                            self.outstanding.len()
                        );
                        self.outstanding.clear();
                    }
                    ReadOutcome::Closed => return Ok(SessionEnd::Closed),
                }
            }
        }
    }

    async fn wait_for_round(&mut self) {
        tokio::select! {
            _ = self.rounds.changed() => {}
            _ = self.shutdown.changed() => {}
            _ = tokio::time::sleep(self.context.network.poll_interval) => {}
        }
    }

    fn handle_all(&mut self, messages: Vec<PeerMessage>) -> Result<(), TorrentError> {
        for message in messages {
            self.handle(message)?;
        }
        Ok(())
    }

    fn handle(&mut self, message: PeerMessage) -> Result<(), TorrentError> {
        let address = self.address;
        self.context.directory.record_message(address, message.kind());

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                tracing::debug!("{} choked us", address);
                self.state.receive_choke();
                // Permission revoked: nothing outstanding will be answered
                self.outstanding.clear();
                self.publish_state();
            }
            PeerMessage::Unchoke => {
                tracing::debug!("{} unchoked us", address);
                self.state.receive_unchoke();
                self.publish_state();
            }
            PeerMessage::Have { piece_index } => {
                if piece_index.as_u32() >= self.context.store.piece_count() {
                    return Err(TorrentError::ProtocolError {
                        message: format!("HAVE for unknown piece {piece_index}"),
                    });
                }
                if self.context.picker.record_peer_has_piece(piece_index, address) {
                    self.remote_pieces += 1;
                    let held = self.remote_pieces;
                    self.context
                        .directory
                        .update_state(address, |record| record.remote_pieces = held);
                }
                self.availability_known = true;
            }
            PeerMessage::Bitfield { bitfield } => {
                let bitfield = Bitfield::from_bytes(&bitfield, self.context.store.piece_count())?;
                for piece in bitfield.pieces() {
                    self.context.picker.record_peer_has_piece(piece, address);
                }
                let held = bitfield.count();
                self.remote_pieces = held;
                self.context
                    .directory
                    .update_state(address, |record| record.remote_pieces = held);
                tracing::debug!("{} holds {} pieces", address, held);
                self.availability_known = true;
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let request = BlockRequest::new(piece_index, offset, data.len() as u32);
                self.outstanding.remove(&request);
                let len = data.len() as u64;
                let outcome = self.context.store.deposit_block(piece_index, offset, data)?;
                tracing::trace!("Block {}@{} from {}: {:?}", piece_index, offset, address, outcome);
                self.context
                    .directory
                    .update_state(address, |record| record.bytes_downloaded += len);
            }
            PeerMessage::Interested
            | PeerMessage::NotInterested
            | PeerMessage::Request { .. }
            | PeerMessage::Cancel { .. } => {
                tracing::debug!("Ignoring {:?} from {} on outbound session", message.kind(), address);
            }
        }
        Ok(())
    }

    fn publish_state(&self) {
        let state = self.state;
        self.context
            .directory
            .update_state(self.address, |record| record.interest = state);
    }
}

fn unregister(context: &SessionContext, address: SocketAddr) {
    context.picker.remove_peer(address);
    context.directory.remove(address);
}
