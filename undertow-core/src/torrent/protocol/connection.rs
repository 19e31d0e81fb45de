//! Framed peer connection over any async byte stream

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::super::{InfoHash, TorrentError};
use super::handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
use super::messages::MessageCodec;
use super::types::{PeerHandshake, PeerMessage};

const READ_CHUNK: usize = 64 * 1024;

/// Result of one bounded receive attempt.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// At least one complete frame was decoded
    Messages(Vec<PeerMessage>),
    /// No bytes arrived within the idle timeout
    Idle,
    /// The remote closed the stream
    Closed,
}

/// Peer connection that owns its stream and the bytes not yet framed.
///
/// Generic over the stream so sessions can be driven over in-memory pipes
/// in tests.
#[derive(Debug)]
pub struct PeerConnection<S = TcpStream> {
    stream: S,
    address: SocketAddr,
    buffer: BytesMut,
}

impl PeerConnection<TcpStream> {
    /// Opens a TCP connection to `address`.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Connect failed or timed out
    pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<Self, TorrentError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Failed to connect to {address}: {e}"),
                });
            }
            Err(_) => {
                return Err(TorrentError::PeerConnectionError {
                    reason: format!("Connection to {address} timed out"),
                });
            }
        };
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, address))
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, address: SocketAddr) -> Self {
        Self {
            stream,
            address,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sends one framed message.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.send_all(std::slice::from_ref(message)).await
    }

    /// Sends several messages in a single write.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_all(&mut self, messages: &[PeerMessage]) -> Result<(), TorrentError> {
        let mut out = BytesMut::new();
        for message in messages {
            MessageCodec::encode_into(message, &mut out);
        }
        self.write(&out).await
    }

    /// Sends our handshake.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Write failed
    pub async fn send_handshake(&mut self, handshake: &PeerHandshake) -> Result<(), TorrentError> {
        self.write(&HandshakeCodec::serialize_handshake(handshake))
            .await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TorrentError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Write to {} failed: {e}", self.address),
            })?;
        self.stream
            .flush()
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Flush to {} failed: {e}", self.address),
            })
    }

    /// Waits for the remote handshake and checks it names `expected`.
    ///
    /// Bytes that follow the handshake in the same read stay buffered for
    /// [`PeerConnection::read_batch`].
    ///
    /// # Errors
    /// - `TorrentError::HandshakeTimeout` - No full handshake within `timeout`
    /// - `TorrentError::HandshakeMismatch` - Handshake is for another torrent
    /// - `TorrentError::ProtocolError` - Malformed handshake
    /// - `TorrentError::PeerConnectionError` - Stream closed or failed
    pub async fn receive_handshake(
        &mut self,
        expected: &InfoHash,
        timeout: Duration,
    ) -> Result<PeerHandshake, TorrentError> {
        let deadline = tokio::time::Instant::now() + timeout;

        while self.buffer.len() < HANDSHAKE_LENGTH {
            let read = tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.buffer))
                .await
                .map_err(|_| TorrentError::HandshakeTimeout {
                    address: self.address,
                })?;
            match read {
                Ok(0) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("{} closed during handshake", self.address),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("Read from {} failed: {e}", self.address),
                    });
                }
            }
        }

        let raw = self.buffer.split_to(HANDSHAKE_LENGTH);
        HandshakeCodec::validate(&raw, expected)
    }

    /// Reads until at least one complete frame is available.
    ///
    /// Each read is bounded by `idle`; silence for that long ends the attempt
    /// with [`ReadOutcome::Idle`]. Already buffered frames are returned without
    /// touching the stream.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` / `TorrentError::UnknownMessageId` - Undecodable frame
    /// - `TorrentError::PeerConnectionError` - Read failed
    pub async fn read_batch(&mut self, idle: Duration) -> Result<ReadOutcome, TorrentError> {
        loop {
            let messages = MessageCodec::frame_stream(&mut self.buffer)?;
            if !messages.is_empty() {
                return Ok(ReadOutcome::Messages(messages));
            }

            self.buffer.reserve(READ_CHUNK);
            match tokio::time::timeout(idle, self.stream.read_buf(&mut self.buffer)).await {
                Err(_) => return Ok(ReadOutcome::Idle),
                Ok(Ok(0)) => return Ok(ReadOutcome::Closed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(TorrentError::PeerConnectionError {
                        reason: format!("Read from {} failed: {e}", self.address),
                    });
                }
            }
        }
    }

    /// Closes the write half. Errors are ignored; the peer may already be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
