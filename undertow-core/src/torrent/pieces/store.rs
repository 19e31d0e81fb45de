//! Shared piece store.
//!
//! Every piece sits behind its own mutex so deposits into different pieces
//! never contend. Aggregate progress (completed count and bitfield) sits
//! behind a second mutex that is only ever taken while already holding the
//! piece lock or on its own, never the other way round. A piece turning
//! verified updates progress, enqueues the piece for the disk writer and
//! queues a HAVE notification before either lock is released, so no reader
//! sees the piece complete without those effects already scheduled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::bitfield::Bitfield;
use super::block::{BlockRequest, BlockState};
use super::piece::{DepositOutcome, Piece};
use crate::torrent::parsing::TorrentDescriptor;
use crate::torrent::{PieceIndex, TorrentError};

/// Verified piece content on its way to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPiece {
    pub index: PieceIndex,
    /// Byte offset of the piece within the output file
    pub offset: u64,
    pub data: Bytes,
}

/// Receiving ends of the store's completion side effects.
///
/// `disk_queue` belongs to the disk writer, `have_notifications` to the
/// listening server.
#[derive(Debug)]
pub struct CompletionEvents {
    pub disk_queue: mpsc::UnboundedReceiver<CompletedPiece>,
    pub have_notifications: mpsc::UnboundedReceiver<PieceIndex>,
}

#[derive(Debug)]
struct Progress {
    completed: u32,
    bitfield: Bitfield,
}

/// In-memory state of every piece of one torrent.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Mutex<Piece>>,
    // (offset in file, length) per piece
    layout: Vec<(u64, u32)>,
    progress: Mutex<Progress>,
    disk_queue: mpsc::UnboundedSender<CompletedPiece>,
    have_notifications: mpsc::UnboundedSender<PieceIndex>,
    complete_tx: watch::Sender<bool>,
    downloaded: AtomicU64,
}

impl PieceStore {
    /// Allocates every piece and block for `descriptor`.
    pub fn new(descriptor: &TorrentDescriptor) -> (Self, CompletionEvents) {
        let piece_count = descriptor.piece_count();
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (have_tx, have_rx) = mpsc::unbounded_channel();
        let (complete_tx, _) = watch::channel(piece_count == 0);

        let mut pieces = Vec::with_capacity(piece_count as usize);
        let mut layout = Vec::with_capacity(piece_count as usize);
        for (index, hash) in descriptor.piece_hashes.iter().enumerate() {
            let index = PieceIndex::new(index as u32);
            let length = descriptor.piece_size(index);
            pieces.push(Mutex::new(Piece::new(index, length, *hash)));
            layout.push((descriptor.piece_offset(index), length));
        }

        let store = Self {
            pieces,
            layout,
            progress: Mutex::new(Progress {
                completed: 0,
                bitfield: Bitfield::new(piece_count),
            }),
            disk_queue: disk_tx,
            have_notifications: have_tx,
            complete_tx,
            downloaded: AtomicU64::new(0),
        };
        let events = CompletionEvents {
            disk_queue: disk_rx,
            have_notifications: have_rx,
        };
        (store, events)
    }

    fn piece(&self, index: PieceIndex) -> Result<&Mutex<Piece>, TorrentError> {
        self.pieces
            .get(index.as_usize())
            .ok_or(TorrentError::PieceOutOfRange { index })
    }

    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Stores one block of data received from a peer.
    ///
    /// Verification runs as soon as the last block of the piece lands. A
    /// block that is already full is left untouched.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceOutOfRange` - If `index` is not a piece of this torrent
    pub fn deposit_block(
        &self,
        index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<DepositOutcome, TorrentError> {
        let len = data.len() as u64;
        let mut piece = self.piece(index)?.lock();
        let outcome = piece.deposit(offset, data);

        match outcome {
            DepositOutcome::PieceVerified => {
                self.downloaded.fetch_add(len, Ordering::Relaxed);
                self.commit_completion(index, &piece, true);
            }
            DepositOutcome::Stored | DepositOutcome::PieceRejected => {
                self.downloaded.fetch_add(len, Ordering::Relaxed);
            }
            DepositOutcome::Duplicate | DepositOutcome::Invalid => {
                tracing::debug!("Ignored block {}@{}: {:?}", index, offset, outcome);
            }
        }
        Ok(outcome)
    }

    /// Verifies a piece against its expected digest.
    ///
    /// Returns true for an already verified piece. On mismatch, including a
    /// piece with missing blocks, every block of the piece is reset to empty.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceOutOfRange` - If `index` is not a piece of this torrent
    pub fn verify(&self, index: PieceIndex) -> Result<bool, TorrentError> {
        let mut piece = self.piece(index)?.lock();
        if piece.is_verified() {
            return Ok(true);
        }
        let verified = piece.verify();
        if verified {
            self.commit_completion(index, &piece, true);
        }
        Ok(verified)
    }

    /// Seeds a piece from bytes already on disk.
    ///
    /// Counts toward progress but is neither queued for writing nor announced.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PieceOutOfRange` - If `index` is not a piece of this torrent
    pub fn restore_piece(&self, index: PieceIndex, content: &Bytes) -> Result<bool, TorrentError> {
        let mut piece = self.piece(index)?.lock();
        if piece.is_verified() {
            return Ok(true);
        }
        let restored = piece.restore(content);
        if restored {
            self.commit_completion(index, &piece, false);
        }
        Ok(restored)
    }

    // Caller holds the piece lock.
    fn commit_completion(&self, index: PieceIndex, piece: &Piece, announce: bool) {
        let mut progress = self.progress.lock();
        if progress.bitfield.has_piece(index) {
            return;
        }
        progress.completed += 1;
        progress.bitfield.set_piece(index);

        if announce {
            if let Some(data) = piece.assemble() {
                let completed = CompletedPiece {
                    index,
                    offset: self.layout[index.as_usize()].0,
                    data,
                };
                if self.disk_queue.send(completed).is_err() {
                    tracing::debug!("Disk writer gone, piece {} not queued", index);
                }
            }
            if self.have_notifications.send(index).is_err() {
                tracing::debug!("Listening server gone, HAVE {} not queued", index);
            }
            tracing::info!(
                "Piece {} verified ({}/{})",
                index,
                progress.completed,
                self.pieces.len()
            );
        }

        if progress.completed as usize == self.pieces.len() {
            self.complete_tx.send_replace(true);
        }
    }

    /// Marks a block as requested. Returns false once the block is full,
    /// so callers can skip blocks another peer already delivered.
    pub fn mark_pending(&self, request: &BlockRequest) -> bool {
        match self.pieces.get(request.piece_index.as_usize()) {
            Some(piece) => piece.lock().mark_pending(request.offset),
            None => false,
        }
    }

    /// Snapshot of every unverified piece with its blocks that are not full.
    ///
    /// Pending blocks are included so that a new round can hand them to a
    /// different peer after the previous batch went stale.
    pub fn remaining_work(&self) -> BTreeMap<PieceIndex, Vec<BlockRequest>> {
        self.pieces
            .iter()
            .enumerate()
            .filter_map(|(index, piece)| {
                let piece = piece.lock();
                if piece.is_verified() {
                    return None;
                }
                let blocks = piece.missing_blocks();
                (!blocks.is_empty()).then(|| (PieceIndex::new(index as u32), blocks))
            })
            .collect()
    }

    /// Current packed availability of verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        self.progress.lock().bitfield.clone()
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.progress.lock().bitfield.has_piece(index)
    }

    pub fn completed_count(&self) -> u32 {
        self.progress.lock().completed
    }

    /// Integer percentage of verified pieces, rounded down.
    pub fn percent_complete(&self) -> u8 {
        let completed = u64::from(self.progress.lock().completed);
        let total = self.pieces.len() as u64;
        if total == 0 {
            return 100;
        }
        (completed * 100 / total) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.progress.lock().completed as usize == self.pieces.len()
    }

    /// Bytes still needed: the sum of the sizes of unverified pieces.
    pub fn left_bytes(&self) -> u64 {
        let progress = self.progress.lock();
        self.layout
            .iter()
            .enumerate()
            .filter(|(index, _)| !progress.bitfield.has_piece(PieceIndex::new(*index as u32)))
            .map(|(_, (_, length))| u64::from(*length))
            .sum()
    }

    /// Payload bytes accepted from peers this run.
    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Bytes of a verified piece for answering a REQUEST.
    pub fn block_data(&self, request: &BlockRequest) -> Option<Bytes> {
        let piece = self.pieces.get(request.piece_index.as_usize())?.lock();
        let content = piece.assemble()?;
        let start = request.offset as usize;
        let end = start.checked_add(request.length as usize)?;
        if end > content.len() {
            return None;
        }
        Some(content.slice(start..end))
    }

    /// Per-block state of one piece.
    pub fn block_states(&self, index: PieceIndex) -> Option<Vec<BlockState>> {
        Some(self.pieces.get(index.as_usize())?.lock().block_states())
    }

    /// Receiver that flips to true once every piece is verified.
    pub fn subscribe_completion(&self) -> watch::Receiver<bool> {
        self.complete_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;
    use crate::torrent::{BLOCK_SIZE, InfoHash};

    fn descriptor_for(content: &[u8], piece_length: u32) -> TorrentDescriptor {
        let piece_hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        TorrentDescriptor::new(
            "http://tracker.test/announce".to_string(),
            InfoHash::new([9u8; 20]),
            "store.bin".to_string(),
            piece_length,
            content.len() as u64,
            piece_hashes,
        )
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_completion_enqueues_and_notifies() {
        let data = content(BLOCK_SIZE as usize * 2);
        let descriptor = descriptor_for(&data, BLOCK_SIZE);
        let (store, mut events) = PieceStore::new(&descriptor);

        let outcome = store
            .deposit_block(PieceIndex::new(1), 0, Bytes::copy_from_slice(&data[16384..]))
            .unwrap();
        assert_eq!(outcome, DepositOutcome::PieceVerified);

        // Effects are visible as soon as the piece reads as complete
        assert!(store.has_piece(PieceIndex::new(1)));
        let queued = events.disk_queue.try_recv().unwrap();
        assert_eq!(queued.index, PieceIndex::new(1));
        assert_eq!(queued.offset, u64::from(BLOCK_SIZE));
        assert_eq!(
            events.have_notifications.try_recv().unwrap(),
            PieceIndex::new(1)
        );
        assert_eq!(store.percent_complete(), 50);
        assert_eq!(store.left_bytes(), u64::from(BLOCK_SIZE));
    }

    #[test]
    fn test_failed_verification_resets_piece() {
        let data = content(BLOCK_SIZE as usize * 2);
        let descriptor = descriptor_for(&data, BLOCK_SIZE * 2);
        let (store, mut events) = PieceStore::new(&descriptor);
        let index = PieceIndex::new(0);

        store
            .deposit_block(index, 0, Bytes::copy_from_slice(&data[..16384]))
            .unwrap();
        let outcome = store
            .deposit_block(index, BLOCK_SIZE, Bytes::from(vec![0u8; 16384]))
            .unwrap();

        assert_eq!(outcome, DepositOutcome::PieceRejected);
        assert_eq!(
            store.block_states(index).unwrap(),
            vec![BlockState::Empty, BlockState::Empty]
        );
        assert!(events.disk_queue.try_recv().is_err());
        assert_eq!(store.remaining_work()[&index].len(), 2);
    }

    #[test]
    fn test_verify_resets_partial_piece() {
        let data = content(BLOCK_SIZE as usize * 2);
        let descriptor = descriptor_for(&data, BLOCK_SIZE * 2);
        let (store, _events) = PieceStore::new(&descriptor);
        let index = PieceIndex::new(0);

        store
            .deposit_block(index, 0, Bytes::copy_from_slice(&data[..16384]))
            .unwrap();
        assert!(!store.verify(index).unwrap());
        assert_eq!(
            store.block_states(index).unwrap(),
            vec![BlockState::Empty, BlockState::Empty]
        );
        assert_eq!(store.remaining_work()[&index].len(), 2);

        store
            .deposit_block(index, 0, Bytes::copy_from_slice(&data[..16384]))
            .unwrap();
        let outcome = store
            .deposit_block(index, BLOCK_SIZE, Bytes::copy_from_slice(&data[16384..]))
            .unwrap();
        assert_eq!(outcome, DepositOutcome::PieceVerified);
        assert!(store.verify(index).unwrap());
        assert!(store.is_complete());
    }

    #[test]
    fn test_mark_pending_refuses_full_blocks() {
        let data = content(BLOCK_SIZE as usize * 2);
        let descriptor = descriptor_for(&data, BLOCK_SIZE * 2);
        let (store, _events) = PieceStore::new(&descriptor);
        let index = PieceIndex::new(0);
        let first = BlockRequest::new(index, 0, BLOCK_SIZE);
        let second = BlockRequest::new(index, BLOCK_SIZE, BLOCK_SIZE);

        assert!(store.mark_pending(&second));
        // Still requestable when a stale batch is handed to another peer
        assert!(store.mark_pending(&second));

        store
            .deposit_block(index, 0, Bytes::copy_from_slice(&data[..16384]))
            .unwrap();
        assert!(!store.mark_pending(&first));

        store
            .deposit_block(index, BLOCK_SIZE, Bytes::copy_from_slice(&data[16384..]))
            .unwrap();
        assert!(!store.mark_pending(&second));
        assert!(!store.mark_pending(&BlockRequest::new(index, 7, 1)));
    }

    #[test]
    fn test_bitfield_follows_completion() {
        let data = content(10 * 1024);
        let descriptor = descriptor_for(&data, 1024);
        let (store, _events) = PieceStore::new(&descriptor);

        for index in [0u32, 1, 9] {
            let start = index as usize * 1024;
            let chunk = Bytes::copy_from_slice(&data[start..(start + 1024).min(data.len())]);
            store
                .deposit_block(PieceIndex::new(index), 0, chunk)
                .unwrap();
        }

        assert_eq!(store.bitfield().as_bytes(), &[0b1100_0000, 0b0100_0000]);
        assert_eq!(store.percent_complete(), 30);
    }

    #[test]
    fn test_remaining_work_lists_non_full_blocks() {
        let data = content(BLOCK_SIZE as usize * 2 + 10);
        let descriptor = descriptor_for(&data, BLOCK_SIZE * 2);
        let (store, _events) = PieceStore::new(&descriptor);

        let request = BlockRequest::new(PieceIndex::new(0), BLOCK_SIZE, BLOCK_SIZE);
        assert!(store.mark_pending(&request));
        assert_eq!(
            store.block_states(PieceIndex::new(0)).unwrap(),
            vec![BlockState::Empty, BlockState::Pending]
        );
        store
            .deposit_block(PieceIndex::new(0), 0, Bytes::copy_from_slice(&data[..16384]))
            .unwrap();

        let remaining = store.remaining_work();
        assert_eq!(remaining[&PieceIndex::new(0)], vec![request]);
        assert_eq!(
            remaining[&PieceIndex::new(1)],
            vec![BlockRequest::new(PieceIndex::new(1), 0, 10)]
        );
    }

    #[test]
    fn test_restore_does_not_announce() {
        let data = content(2048);
        let descriptor = descriptor_for(&data, 1024);
        let (store, mut events) = PieceStore::new(&descriptor);

        let restored = store
            .restore_piece(PieceIndex::new(0), &Bytes::copy_from_slice(&data[..1024]))
            .unwrap();

        assert!(restored);
        assert_eq!(store.completed_count(), 1);
        assert!(events.disk_queue.try_recv().is_err());
        assert!(events.have_notifications.try_recv().is_err());
    }

    #[test]
    fn test_block_data_served_only_from_verified_pieces() {
        let data = content(2048);
        let descriptor = descriptor_for(&data, 1024);
        let (store, _events) = PieceStore::new(&descriptor);
        let request = BlockRequest::new(PieceIndex::new(1), 512, 256);

        assert!(store.block_data(&request).is_none());
        store
            .deposit_block(PieceIndex::new(1), 0, Bytes::copy_from_slice(&data[1024..]))
            .unwrap();
        assert_eq!(
            store.block_data(&request).unwrap().as_ref(),
            &data[1536..1792]
        );
        assert!(
            store
                .block_data(&BlockRequest::new(PieceIndex::new(1), 1000, 100))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_completion_watch_fires() {
        let data = content(1024);
        let descriptor = descriptor_for(&data, 1024);
        let (store, _events) = PieceStore::new(&descriptor);
        let mut done = store.subscribe_completion();

        store
            .deposit_block(PieceIndex::new(0), 0, Bytes::from(data))
            .unwrap();

        done.wait_for(|complete| *complete).await.unwrap();
        assert!(store.is_complete());
        assert_eq!(store.percent_complete(), 100);
    }

    #[test]
    fn test_out_of_range_piece() {
        let descriptor = descriptor_for(&content(1024), 1024);
        let (store, _events) = PieceStore::new(&descriptor);

        assert!(matches!(
            store.deposit_block(PieceIndex::new(4), 0, Bytes::new()),
            Err(TorrentError::PieceOutOfRange { .. })
        ));
    }
}
