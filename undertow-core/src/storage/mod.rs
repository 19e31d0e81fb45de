//! Storage layer for downloaded pieces.
//!
//! Verified pieces are persisted by a single background [`DiskWriter`] at
//! their byte offset in the output file. A [`ResumeState`] side file records
//! which pieces are already on disk so a later run can skip them.

pub mod disk_writer;
pub mod resume;

use std::path::PathBuf;

pub use disk_writer::{DiskWriter, WriterReport, read_piece_at};
pub use resume::ResumeState;

use crate::torrent::PieceIndex;

/// Errors that occur during storage operations.
///
/// Covers output-file and resume-file failures. None of them abort the
/// download as a whole; the disk writer logs and moves on.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Output file is shorter than the piece being read back
    #[error("Piece {index} not found in output file")]
    PieceNotFound {
        /// Index of the piece that could not be read
        index: PieceIndex,
    },

    /// Resume file exists but could not be read or written
    #[error("Resume file {path} unusable: {reason}")]
    ResumeFile {
        /// Location of the resume file
        path: PathBuf,
        /// Underlying failure description
        reason: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
