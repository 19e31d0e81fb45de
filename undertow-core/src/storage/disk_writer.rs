//! Background writer persisting verified pieces.
//!
//! Pieces arrive on the store's unbounded disk queue. Each one is written at
//! its absolute byte offset in the single output file, then recorded in the
//! resume file. A failed write is logged and skipped so one bad piece never
//! stops the download.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use super::{ResumeState, StorageError};
use crate::torrent::PieceIndex;
use crate::torrent::pieces::CompletedPiece;

/// Totals reported when the writer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub pieces_written: u32,
    pub bytes_written: u64,
    pub failed_writes: u32,
}

/// Consumes completed pieces and writes them to the output file.
#[derive(Debug)]
pub struct DiskWriter {
    output_path: PathBuf,
    queue: mpsc::UnboundedReceiver<CompletedPiece>,
    resume: ResumeState,
    shutdown: watch::Receiver<bool>,
}

impl DiskWriter {
    pub fn new(
        output_path: impl Into<PathBuf>,
        queue: mpsc::UnboundedReceiver<CompletedPiece>,
        resume: ResumeState,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            output_path: output_path.into(),
            queue,
            resume,
            shutdown,
        }
    }

    /// Writes pieces until every piece is on disk, the queue closes, or
    /// shutdown is signalled. Pieces already queued at shutdown are still
    /// written.
    ///
    /// # Errors
    /// - `StorageError::Io` - Parent directory of the output file could not be created
    pub async fn run(mut self) -> Result<WriterReport, StorageError> {
        if let Some(parent) = self.output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut report = WriterReport::default();
        loop {
            if self.resume.is_complete() {
                tracing::info!(
                    "All {} pieces written to {}",
                    self.resume.piece_count(),
                    self.output_path.display()
                );
                break;
            }
            if *self.shutdown.borrow() {
                self.drain(&mut report).await;
                break;
            }

            tokio::select! {
                piece = self.queue.recv() => match piece {
                    Some(piece) => self.persist(piece, &mut report).await,
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Engine gone without signalling: treat as shutdown
                        self.drain(&mut report).await;
                        break;
                    }
                }
            }
        }

        tracing::debug!(
            "Disk writer stopped: {} pieces, {} bytes, {} failures",
            report.pieces_written,
            report.bytes_written,
            report.failed_writes
        );
        Ok(report)
    }

    async fn drain(&mut self, report: &mut WriterReport) {
        while let Ok(piece) = self.queue.try_recv() {
            self.persist(piece, report).await;
        }
    }

    async fn persist(&mut self, piece: CompletedPiece, report: &mut WriterReport) {
        let len = piece.data.len() as u64;
        match write_piece_at(&self.output_path, piece.offset, &piece.data).await {
            Ok(()) => {
                report.pieces_written += 1;
                report.bytes_written += len;
                tracing::debug!("Wrote piece {} ({} bytes) at {}", piece.index, len, piece.offset);

                if self.resume.mark(piece.index) {
                    if let Err(e) = self.resume.persist().await {
                        tracing::warn!("Failed to update resume file: {}", e);
                    }
                }
            }
            Err(e) => {
                report.failed_writes += 1;
                tracing::error!("Failed to write piece {}: {}", piece.index, e);
            }
        }
    }
}

async fn write_piece_at(path: &Path, offset: u64, data: &[u8]) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// Reads `length` bytes of piece `index` back from `offset` in the output file.
///
/// # Errors
/// - `StorageError::PieceNotFound` - File is missing or shorter than the piece
/// - `StorageError::Io` - Read failed
pub async fn read_piece_at(
    path: &Path,
    index: PieceIndex,
    offset: u64,
    length: u32,
) -> Result<Bytes, StorageError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StorageError::PieceNotFound { index });
        }
        Err(e) => return Err(e.into()),
    };

    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; length as usize];
    match file.read_exact(&mut buffer).await {
        Ok(_) => Ok(Bytes::from(buffer)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(StorageError::PieceNotFound { index })
        }
        Err(e) => Err(e.into()),
    }
}
