//! BitTorrent wire protocol message serialization, deserialization and framing

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

/// Largest frame body accepted from a peer. Anything bigger is treated as a
/// corrupt length prefix rather than buffered.
pub const MAX_FRAME_LENGTH: usize = 1 << 20;

const LENGTH_PREFIX: usize = 4;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Self::encode_into(message, &mut buf);
        buf.to_vec()
    }

    /// Appends the framed encoding of `message` to `buf`.
    pub fn encode_into(message: &PeerMessage, buf: &mut BytesMut) {
        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
        }
    }

    /// Deserializes one complete frame (length prefix included).
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame or wrong body length for its id
    /// - `TorrentError::UnknownMessageId` - Id outside 0..=8
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < LENGTH_PREFIX {
            return Err(TorrentError::ProtocolError {
                message: "Message too short".to_string(),
            });
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = data
            .get(LENGTH_PREFIX..LENGTH_PREFIX + length)
            .ok_or_else(|| TorrentError::ProtocolError {
                message: "Incomplete message".to_string(),
            })?;
        Self::decode_body(Bytes::copy_from_slice(body))
    }

    /// Decodes a frame body: id byte plus payload, without the length prefix.
    fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();

        match message_id {
            0 => check_payload_len(&body, 0, "Choke").map(|()| PeerMessage::Choke),
            1 => check_payload_len(&body, 0, "Unchoke").map(|()| PeerMessage::Unchoke),
            2 => check_payload_len(&body, 0, "Interested").map(|()| PeerMessage::Interested),
            3 => check_payload_len(&body, 0, "NotInterested").map(|()| PeerMessage::NotInterested),
            4 => {
                check_payload_len(&body, 4, "Have")?;
                let piece_index = PieceIndex::new(body.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => Ok(PeerMessage::Bitfield { bitfield: body }),
            6 | 8 => {
                let name = if message_id == 6 { "Request" } else { "Cancel" };
                check_payload_len(&body, 12, name)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if body.len() < 8 {
                    return Err(TorrentError::ProtocolError {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            id => Err(TorrentError::UnknownMessageId { id }),
        }
    }

    /// Splits every complete frame off the front of `buffer`.
    ///
    /// A trailing partial frame stays in `buffer` for the next read. Keep-alive
    /// frames are consumed and surfaced as [`PeerMessage::KeepAlive`].
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Frame longer than [`MAX_FRAME_LENGTH`] or malformed body
    /// - `TorrentError::UnknownMessageId` - Id outside 0..=8
    pub fn frame_stream(buffer: &mut BytesMut) -> Result<Vec<PeerMessage>, TorrentError> {
        let mut messages = Vec::new();

        while buffer.len() >= LENGTH_PREFIX {
            let length =
                u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
            if length > MAX_FRAME_LENGTH {
                return Err(TorrentError::ProtocolError {
                    message: format!("Frame length {length} exceeds limit"),
                });
            }
            if buffer.len() < LENGTH_PREFIX + length {
                break;
            }

            buffer.advance(LENGTH_PREFIX);
            let body = buffer.split_to(length).freeze();
            messages.push(Self::decode_body(body)?);
        }

        Ok(messages)
    }
}

fn check_payload_len(payload: &Bytes, expected: usize, name: &str) -> Result<(), TorrentError> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(TorrentError::ProtocolError {
            message: format!("Invalid {name} message length: {}", payload.len() + 1),
        })
    }
}
