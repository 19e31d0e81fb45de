//! Packed bit-per-piece set in wire order

use bytes::Bytes;

use crate::torrent::{PieceIndex, TorrentError};

/// Piece availability bitmap.
///
/// Bit 7 of byte 0 is piece 0; spare bits in the last byte stay zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Empty bitfield sized for `piece_count` pieces.
    pub fn new(piece_count: u32) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8) as usize],
            piece_count,
        }
    }

    /// Parses a BITFIELD payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Payload size does not match the piece count
    pub fn from_bytes(bits: &[u8], piece_count: u32) -> Result<Self, TorrentError> {
        let expected = piece_count.div_ceil(8) as usize;
        if bits.len() != expected {
            return Err(TorrentError::ProtocolError {
                message: format!(
                    "Invalid bitfield size: expected {} bytes for {} pieces, got {}",
                    expected,
                    piece_count,
                    bits.len()
                ),
            });
        }

        let mut bitfield = Self {
            bits: bits.to_vec(),
            piece_count,
        };
        // Spare bits carry no meaning
        if let Some(last) = bitfield.bits.last_mut() {
            let spare = expected as u32 * 8 - piece_count;
            *last &= 0xFFu8.checked_shl(spare).unwrap_or(0);
        }
        Ok(bitfield)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_u32();
        if index < self.piece_count {
            self.bits[(index / 8) as usize] |= 0x80 >> (index % 8);
        }
    }

    /// Set piece indices in ascending order.
    pub fn pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|index| self.has_piece(*index))
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Payload for a BITFIELD message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}
