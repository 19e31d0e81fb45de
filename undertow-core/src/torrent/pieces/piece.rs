//! Piece: ordered blocks plus the expected SHA-1 digest

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::block::{Block, BlockRequest, BlockState};
use crate::torrent::PieceIndex;

/// Result of handing a block of data to a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositOutcome {
    /// Block stored; the piece still has missing blocks
    Stored,
    /// Block completed the piece and the digest matched
    PieceVerified,
    /// Block completed the piece but the digest did not match; every block was reset
    PieceRejected,
    /// Block was already full or the piece is already verified
    Duplicate,
    /// Offset or length does not address a block of this piece
    Invalid,
}

#[derive(Debug)]
pub(crate) struct Piece {
    index: PieceIndex,
    length: u32,
    expected_hash: [u8; 20],
    blocks: Vec<Block>,
    verified: bool,
}

impl Piece {
    pub(crate) fn new(index: PieceIndex, length: u32, expected_hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            expected_hash,
            blocks: Block::layout(length),
            verified: false,
        }
    }

    pub(crate) fn is_verified(&self) -> bool {
        self.verified
    }

    /// Complete means every block is full, verified or not.
    pub(crate) fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| b.state() == BlockState::Full)
    }

    pub(crate) fn block_states(&self) -> Vec<BlockState> {
        self.blocks.iter().map(Block::state).collect()
    }

    fn block_mut(&mut self, offset: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.offset() == offset)
    }

    /// Moves an empty block to `Pending`. Returns false if the block is
    /// already full or does not exist.
    pub(crate) fn mark_pending(&mut self, offset: u32) -> bool {
        if self.verified {
            return false;
        }
        match self.block_mut(offset) {
            Some(block) => {
                block.mark_pending();
                block.state() != BlockState::Full
            }
            None => false,
        }
    }

    /// Writes `data` into the block at `offset` and verifies once the last
    /// block arrives.
    pub(crate) fn deposit(&mut self, offset: u32, data: Bytes) -> DepositOutcome {
        if self.verified {
            return DepositOutcome::Duplicate;
        }
        let Some(block) = self.block_mut(offset) else {
            return DepositOutcome::Invalid;
        };
        if block.length() as usize != data.len() {
            return DepositOutcome::Invalid;
        }
        if !block.fill(data) {
            return DepositOutcome::Duplicate;
        }

        if !self.is_complete() {
            return DepositOutcome::Stored;
        }
        if self.verify() {
            DepositOutcome::PieceVerified
        } else {
            DepositOutcome::PieceRejected
        }
    }

    /// SHA-1 over the block data in order, compared to the expected digest.
    ///
    /// On mismatch every block returns to `Empty` and the piece has to be
    /// fetched again in full. An incomplete piece never matches.
    pub(crate) fn verify(&mut self) -> bool {
        if !self.is_complete() {
            self.reset();
            return false;
        }
        let mut hasher = Sha1::new();
        for block in &self.blocks {
            if let Some(data) = block.data() {
                hasher.update(data);
            }
        }
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.expected_hash {
            self.verified = true;
            true
        } else {
            tracing::warn!(
                "Piece {} failed verification: expected {}, got {}",
                self.index,
                hex::encode(self.expected_hash),
                hex::encode(digest)
            );
            self.reset();
            false
        }
    }

    pub(crate) fn reset(&mut self) {
        self.verified = false;
        for block in &mut self.blocks {
            block.reset();
        }
    }

    /// Fills every block from previously persisted bytes and verifies.
    pub(crate) fn restore(&mut self, content: &Bytes) -> bool {
        if content.len() != self.length as usize {
            return false;
        }
        for block in &mut self.blocks {
            let start = block.offset() as usize;
            let end = start + block.length() as usize;
            block.reset();
            block.fill(content.slice(start..end));
        }
        self.verify()
    }

    /// Concatenated block data. Only available once verified.
    pub(crate) fn assemble(&self) -> Option<Bytes> {
        if !self.verified {
            return None;
        }
        if let [single] = self.blocks.as_slice() {
            return single.data().cloned();
        }
        let mut content = BytesMut::with_capacity(self.length as usize);
        for block in &self.blocks {
            content.extend_from_slice(block.data()?);
        }
        Some(content.freeze())
    }

    /// Blocks that are not yet full, in offset order.
    pub(crate) fn missing_blocks(&self) -> Vec<BlockRequest> {
        self.blocks
            .iter()
            .filter(|b| b.state() != BlockState::Full)
            .map(|b| BlockRequest::new(self.index, b.offset(), b.length()))
            .collect()
    }
}
