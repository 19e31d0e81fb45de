//! Block: the 16 KiB unit of transfer inside a piece

use bytes::Bytes;

use crate::torrent::protocol::PeerMessage;
use crate::torrent::{BLOCK_SIZE, PieceIndex};

/// Per-block download state.
///
/// Transitions are monotone `Empty -> Pending -> Full`; only a failed piece
/// verification moves blocks back to `Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Empty,
    Pending,
    Full,
}

/// Address of one block: the (piece, block) pair handed out by selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece_index: PieceIndex, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    /// Wire REQUEST for this block.
    pub fn to_message(self) -> PeerMessage {
        PeerMessage::Request {
            piece_index: self.piece_index,
            offset: self.offset,
            length: self.length,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Block {
    offset: u32,
    length: u32,
    state: BlockState,
    data: Option<Bytes>,
}

impl Block {
    pub(crate) fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            state: BlockState::Empty,
            data: None,
        }
    }

    /// Splits a piece of `piece_length` bytes into block-sized chunks.
    pub(crate) fn layout(piece_length: u32) -> Vec<Block> {
        (0..piece_length)
            .step_by(BLOCK_SIZE as usize)
            .map(|offset| Block::new(offset, BLOCK_SIZE.min(piece_length - offset)))
            .collect()
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn length(&self) -> u32 {
        self.length
    }

    pub(crate) fn state(&self) -> BlockState {
        self.state
    }

    pub(crate) fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// `Empty -> Pending`. Returns false from any other state.
    pub(crate) fn mark_pending(&mut self) -> bool {
        if self.state == BlockState::Empty {
            self.state = BlockState::Pending;
            true
        } else {
            false
        }
    }

    /// Stores `data` unless the block is already full.
    pub(crate) fn fill(&mut self, data: Bytes) -> bool {
        if self.state == BlockState::Full {
            return false;
        }
        self.data = Some(data);
        self.state = BlockState::Full;
        true
    }

    pub(crate) fn reset(&mut self) {
        self.state = BlockState::Empty;
        self.data = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_truncates_final_block() {
        let blocks = Block::layout(BLOCK_SIZE * 2 + 100);

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].offset(), BLOCK_SIZE);
        assert_eq!(blocks[2].offset(), BLOCK_SIZE * 2);
        assert_eq!(blocks[2].length(), 100);
    }

    #[test]
    fn test_state_transitions() {
        let mut block = Block::new(0, 4);
        assert!(block.mark_pending());
        assert!(!block.mark_pending());
        assert!(block.fill(Bytes::from_static(b"abcd")));
        assert!(!block.fill(Bytes::from_static(b"wxyz")));
        assert_eq!(block.data().unwrap().as_ref(), b"abcd");

        block.reset();
        assert_eq!(block.state(), BlockState::Empty);
        assert!(block.data().is_none());
    }
}
