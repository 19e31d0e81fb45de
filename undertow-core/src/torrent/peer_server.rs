//! Listening server answering inbound peers.
//!
//! One task owns the listener and the write half of every accepted socket.
//! Each socket's read half gets a small forwarding task that ships raw bytes
//! back over a channel, so all protocol handling and every reply happens on
//! the single server task. HAVE notifications from the piece store are
//! broadcast to handshaken peers after each readable event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::peer_directory::{PeerDirection, PeerDirectory};
use super::pieces::{BlockRequest, PieceStore};
use super::protocol::{
    HANDSHAKE_LENGTH, HandshakeCodec, MessageCodec, MessageKind, PeerHandshake, PeerId,
    PeerMessage,
};
use super::{InfoHash, PieceIndex, TorrentError};

const READ_CHUNK: usize = 16 * 1024;
const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
enum ServerEvent {
    Readable { address: SocketAddr, bytes: Bytes },
    Closed { address: SocketAddr },
}

#[derive(Debug)]
struct InboundPeer {
    writer: OwnedWriteHalf,
    buffer: BytesMut,
    handshaken: bool,
    reader: JoinHandle<()>,
}

/// Handles shared with the rest of the engine.
#[derive(Debug)]
struct ServerContext {
    store: Arc<PieceStore>,
    directory: Arc<PeerDirectory>,
    info_hash: InfoHash,
    peer_id: PeerId,
    uploaded: Arc<AtomicU64>,
}

/// What one readable event asks the server to do.
#[derive(Debug, Default)]
struct Response {
    out: BytesMut,
    close: bool,
}

/// Inbound side of the peer-wire protocol.
#[derive(Debug)]
pub struct PeerServer {
    listener: TcpListener,
    context: ServerContext,
    have_notifications: mpsc::UnboundedReceiver<PieceIndex>,
    shutdown: watch::Receiver<bool>,
    peers: HashMap<SocketAddr, InboundPeer>,
}

impl PeerServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Address unavailable
    pub async fn bind(
        address: SocketAddr,
        store: Arc<PieceStore>,
        directory: Arc<PeerDirectory>,
        info_hash: InfoHash,
        peer_id: PeerId,
        have_notifications: mpsc::UnboundedReceiver<PieceIndex>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TorrentError> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!("Listening for peers on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            context: ServerContext {
                store,
                directory,
                info_hash,
                peer_id,
                uploaded: Arc::new(AtomicU64::new(0)),
            },
            have_notifications,
            shutdown,
            peers: HashMap::new(),
        })
    }

    /// Address actually bound, useful when binding port 0.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Socket already closed
    pub fn local_addr(&self) -> Result<SocketAddr, TorrentError> {
        Ok(self.listener.local_addr()?)
    }

    /// Counter of payload bytes served, shared with the tracker announces.
    pub fn uploaded(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.context.uploaded)
    }

    /// Serves peers until shutdown is signalled.
    pub async fn run(mut self) {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => self.accept(stream, address, events_tx.clone()),
                    Err(e) => tracing::warn!("Failed to accept connection: {}", e),
                },
                Some(event) = events_rx.recv() => match event {
                    ServerEvent::Readable { address, bytes } => {
                        self.on_readable(address, bytes).await;
                        self.broadcast_haves().await;
                    }
                    ServerEvent::Closed { address } => {
                        tracing::debug!("{} closed its connection", address);
                        self.close(address).await;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let addresses: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for address in addresses {
            self.close(address).await;
        }
        tracing::info!(
            "Listening server stopped after serving {} bytes",
            self.context.uploaded.load(Ordering::Relaxed)
        );
    }

    fn accept(&mut self, stream: TcpStream, address: SocketAddr, events: mpsc::Sender<ServerEvent>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed for {}: {}", address, e);
        }
        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(forward_reads(address, reader, events));

        self.context.directory.register(address, PeerDirection::Inbound);
        self.peers.insert(
            address,
            InboundPeer {
                writer,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                handshaken: false,
                reader,
            },
        );
        tracing::info!("Accepted inbound peer {}", address);
    }

    async fn on_readable(&mut self, address: SocketAddr, bytes: Bytes) {
        let Some(peer) = self.peers.get_mut(&address) else {
            return;
        };
        peer.buffer.extend_from_slice(&bytes);

        let response = match respond(address, peer, &self.context) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Dropping inbound peer {}: {}", address, e);
                self.close(address).await;
                return;
            }
        };

        if !response.out.is_empty() {
            if let Err(e) = peer.writer.write_all(&response.out).await {
                tracing::debug!("Write to {} failed: {}", address, e);
                self.close(address).await;
                return;
            }
        }
        if response.close {
            self.close(address).await;
        }
    }

    async fn broadcast_haves(&mut self) {
        let mut out = BytesMut::new();
        while let Ok(piece_index) = self.have_notifications.try_recv() {
            MessageCodec::encode_into(&PeerMessage::Have { piece_index }, &mut out);
        }
        if out.is_empty() {
            return;
        }

        let mut failed = Vec::new();
        for (address, peer) in self.peers.iter_mut().filter(|(_, peer)| peer.handshaken) {
            if peer.writer.write_all(&out).await.is_err() {
                failed.push(*address);
            }
        }
        for address in failed {
            self.close(address).await;
        }
    }

    async fn close(&mut self, address: SocketAddr) {
        if let Some(mut peer) = self.peers.remove(&address) {
            peer.reader.abort();
            let _ = peer.writer.shutdown().await;
        }
        self.context.directory.remove(address);
    }
}

/// Handles everything buffered for one peer and collects the replies.
fn respond(
    address: SocketAddr,
    peer: &mut InboundPeer,
    context: &ServerContext,
) -> Result<Response, TorrentError> {
    let mut response = Response::default();

    if !peer.handshaken {
        if peer.buffer.len() < HANDSHAKE_LENGTH {
            return Ok(response);
        }
        if !HandshakeCodec::looks_like_handshake(&peer.buffer) {
            return Err(TorrentError::ProtocolError {
                message: "expected handshake".to_string(),
            });
        }
        let raw = peer.buffer.split_to(HANDSHAKE_LENGTH);
        let theirs = HandshakeCodec::validate(&raw, &context.info_hash)?;
        context.directory.set_peer_id(address, theirs.peer_id);
        context
            .directory
            .record_message(address, MessageKind::Handshake);

        let ours = PeerHandshake::new(context.info_hash, context.peer_id);
        response
            .out
            .extend_from_slice(&HandshakeCodec::serialize_handshake(&ours));
        MessageCodec::encode_into(
            &PeerMessage::Bitfield {
                bitfield: context.store.bitfield().to_bytes(),
            },
            &mut response.out,
        );
        peer.handshaken = true;
        tracing::debug!("Handshake with inbound peer {} ({})", address, theirs.peer_id);
    }

    for message in MessageCodec::frame_stream(&mut peer.buffer)? {
        context.directory.record_message(address, message.kind());

        match message {
            PeerMessage::Interested => {
                MessageCodec::encode_into(&PeerMessage::Unchoke, &mut response.out);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                if !context.directory.has_received(address, MessageKind::Interested) {
                    tracing::debug!("{} sent REQUEST before INTERESTED, ignored", address);
                    continue;
                }
                let request = BlockRequest::new(piece_index, offset, length);
                let data = context
                    .store
                    .has_piece(piece_index)
                    .then(|| context.store.block_data(&request))
                    .flatten();
                let Some(data) = data else {
                    tracing::debug!("{} requested unavailable block {}@{}", address, piece_index, offset);
                    continue;
                };

                let served = data.len() as u64;
                MessageCodec::encode_into(
                    &PeerMessage::Piece {
                        piece_index,
                        offset,
                        data,
                    },
                    &mut response.out,
                );
                context.uploaded.fetch_add(served, Ordering::Relaxed);
                context
                    .directory
                    .update_state(address, |record| record.bytes_uploaded += served);
            }
            PeerMessage::NotInterested => {
                MessageCodec::encode_into(&PeerMessage::Choke, &mut response.out);
                context.directory.clear_history(address);
                response.close = true;
                break;
            }
            other => {
                tracing::trace!("Ignoring {:?} from inbound peer {}", other.kind(), address);
            }
        }
    }

    Ok(response)
}

async fn forward_reads(
    address: SocketAddr,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ServerEvent>,
) {
    let mut chunk = BytesMut::with_capacity(READ_CHUNK);
    loop {
        chunk.reserve(READ_CHUNK);
        let event = match reader.read_buf(&mut chunk).await {
            Ok(0) | Err(_) => ServerEvent::Closed { address },
            Ok(_) => ServerEvent::Readable {
                address,
                bytes: chunk.split().freeze(),
            },
        };
        let closed = matches!(event, ServerEvent::Closed { .. });
        if events.send(event).await.is_err() || closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sha1::{Digest, Sha1};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::torrent::parsing::TorrentDescriptor;

    const PIECE_LENGTH: usize = 64;
    const INFO_HASH: [u8; 20] = [9u8; 20];

    struct Harness {
        address: SocketAddr,
        store: Arc<PieceStore>,
        directory: Arc<PeerDirectory>,
        uploaded: Arc<AtomicU64>,
        content: Vec<u8>,
        shutdown: watch::Sender<bool>,
        server: JoinHandle<()>,
    }

    async fn start_server(restore_first: bool) -> Harness {
        let content: Vec<u8> = (0..PIECE_LENGTH * 2).map(|i| (i * 7 % 256) as u8).collect();
        let hashes = content
            .chunks(PIECE_LENGTH)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let descriptor = TorrentDescriptor::new(
            "http://tracker.test/announce".to_string(),
            InfoHash::new(INFO_HASH),
            "served.bin".to_string(),
            PIECE_LENGTH as u32,
            content.len() as u64,
            hashes,
        );
        let (store, events) = PieceStore::new(&descriptor);
        let store = Arc::new(store);
        if restore_first {
            let first = Bytes::copy_from_slice(&content[..PIECE_LENGTH]);
            assert!(store.restore_piece(PieceIndex::new(0), &first).unwrap());
        }
        let directory = Arc::new(PeerDirectory::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let server = PeerServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&store),
            Arc::clone(&directory),
            InfoHash::new(INFO_HASH),
            PeerId::new([3u8; 20]),
            events.have_notifications,
            shutdown_rx,
        )
        .await
        .unwrap();
        let address = server.local_addr().unwrap();
        let uploaded = server.uploaded();
        let server = tokio::spawn(server.run());

        Harness {
            address,
            store,
            directory,
            uploaded,
            content,
            shutdown,
            server,
        }
    }

    async fn handshake(stream: &mut TcpStream, info_hash: [u8; 20]) {
        let ours = PeerHandshake::new(InfoHash::new(info_hash), PeerId::new([4u8; 20]));
        stream
            .write_all(&HandshakeCodec::serialize_handshake(&ours))
            .await
            .unwrap();
    }

    async fn send(stream: &mut TcpStream, message: &PeerMessage) {
        stream
            .write_all(&MessageCodec::serialize_message(message))
            .await
            .unwrap();
    }

    async fn read_message(stream: &mut TcpStream) -> PeerMessage {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let mut frame = prefix.to_vec();
        frame.resize(4 + u32::from_be_bytes(prefix) as usize, 0);
        stream.read_exact(&mut frame[4..]).await.unwrap();
        MessageCodec::deserialize_message(&frame).unwrap()
    }

    async fn read_handshake_reply(stream: &mut TcpStream) -> PeerHandshake {
        let mut raw = [0u8; HANDSHAKE_LENGTH];
        stream.read_exact(&mut raw).await.unwrap();
        HandshakeCodec::validate(&raw, &InfoHash::new(INFO_HASH)).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requested_block_after_interest() {
        let harness = start_server(true).await;
        let mut client = TcpStream::connect(harness.address).await.unwrap();

        handshake(&mut client, INFO_HASH).await;
        let reply = read_handshake_reply(&mut client).await;
        assert_eq!(reply.peer_id, PeerId::new([3u8; 20]));
        assert_eq!(
            read_message(&mut client).await,
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1000_0000]),
            }
        );

        send(&mut client, &PeerMessage::Interested).await;
        assert_eq!(read_message(&mut client).await, PeerMessage::Unchoke);

        send(
            &mut client,
            &PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 16,
                length: 8,
            },
        )
        .await;
        assert_eq!(
            read_message(&mut client).await,
            PeerMessage::Piece {
                piece_index: PieceIndex::new(0),
                offset: 16,
                data: Bytes::copy_from_slice(&harness.content[16..24]),
            }
        );
        assert_eq!(harness.uploaded.load(Ordering::Relaxed), 8);

        send(&mut client, &PeerMessage::NotInterested).await;
        assert_eq!(read_message(&mut client).await, PeerMessage::Choke);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        harness.shutdown.send(true).unwrap();
        harness.server.await.unwrap();
        assert!(harness.directory.is_empty());
    }

    #[tokio::test]
    async fn test_request_without_interest_is_ignored() {
        let harness = start_server(true).await;
        let mut client = TcpStream::connect(harness.address).await.unwrap();

        handshake(&mut client, INFO_HASH).await;
        read_handshake_reply(&mut client).await;
        read_message(&mut client).await;

        send(
            &mut client,
            &PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: 8,
            },
        )
        .await;
        send(&mut client, &PeerMessage::Interested).await;

        // The first reply is the UNCHOKE, not a PIECE
        assert_eq!(read_message(&mut client).await, PeerMessage::Unchoke);
        assert_eq!(harness.uploaded.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_wrong_info_hash_closes_connection() {
        let harness = start_server(false).await;
        let mut client = TcpStream::connect(harness.address).await.unwrap();

        handshake(&mut client, [0xAB; 20]).await;

        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(read.is_ok());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_broadcasts_have_after_readable_event() {
        let harness = start_server(false).await;
        let mut client = TcpStream::connect(harness.address).await.unwrap();

        handshake(&mut client, INFO_HASH).await;
        read_handshake_reply(&mut client).await;
        assert_eq!(
            read_message(&mut client).await,
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0]),
            }
        );

        let second = Bytes::copy_from_slice(&harness.content[PIECE_LENGTH..]);
        harness
            .store
            .deposit_block(PieceIndex::new(1), 0, second)
            .unwrap();
        assert!(harness.store.has_piece(PieceIndex::new(1)));

        send(&mut client, &PeerMessage::KeepAlive).await;
        assert_eq!(
            read_message(&mut client).await,
            PeerMessage::Have {
                piece_index: PieceIndex::new(1),
            }
        );
    }
}
