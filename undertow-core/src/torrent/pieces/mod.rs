//! Piece and block data model shared by every session.

pub mod bitfield;
pub mod block;
pub mod piece;
pub mod store;

pub use bitfield::Bitfield;
pub use block::{BlockRequest, BlockState};
pub use piece::DepositOutcome;
pub use store::{CompletedPiece, CompletionEvents, PieceStore};
