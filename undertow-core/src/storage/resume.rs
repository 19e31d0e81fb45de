//! Resume side file: one byte per piece, 1 once the piece is on disk.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::StorageError;
use crate::torrent::PieceIndex;

const VERIFIED: u8 = 1;
const MISSING: u8 = 0;

/// Per-piece persisted completion flags.
///
/// The file is rewritten in full after each newly written piece. A file
/// shorter than the piece count leaves the trailing pieces incomplete;
/// extra bytes are ignored.
#[derive(Debug, Clone)]
pub struct ResumeState {
    path: PathBuf,
    flags: Vec<bool>,
}

impl ResumeState {
    /// Creates an all-incomplete state for `piece_count` pieces.
    pub fn new(path: impl Into<PathBuf>, piece_count: usize) -> Self {
        Self {
            path: path.into(),
            flags: vec![false; piece_count],
        }
    }

    /// Loads flags from `path`; a missing file means nothing is complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::ResumeFile` - If the file exists but cannot be read
    pub async fn load(path: impl Into<PathBuf>, piece_count: usize) -> Result<Self, StorageError> {
        let mut state = Self::new(path, piece_count);

        let contents = match tokio::fs::read(&state.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(state),
            Err(e) => {
                return Err(StorageError::ResumeFile {
                    path: state.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        for (flag, byte) in state.flags.iter_mut().zip(contents) {
            *flag = byte == VERIFIED;
        }

        tracing::debug!(
            "Loaded resume state from {}: {}/{} pieces",
            state.path.display(),
            state.completed_count(),
            state.flags.len()
        );
        Ok(state)
    }

    /// Location of the side file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn piece_count(&self) -> usize {
        self.flags.len()
    }

    /// Whether `index` is flagged as on disk.
    pub fn is_verified(&self, index: PieceIndex) -> bool {
        self.flags.get(index.as_usize()).copied().unwrap_or(false)
    }

    /// Flags `index` as on disk. Returns false for out-of-range indices.
    pub fn mark(&mut self, index: PieceIndex) -> bool {
        match self.flags.get_mut(index.as_usize()) {
            Some(flag) => {
                *flag = true;
                true
            }
            None => false,
        }
    }

    /// Clears the flag for `index`, used when restored data fails verification.
    pub fn clear(&mut self, index: PieceIndex) {
        if let Some(flag) = self.flags.get_mut(index.as_usize()) {
            *flag = false;
        }
    }

    /// Indices currently flagged, ascending.
    pub fn completed_indices(&self) -> Vec<PieceIndex> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, flag)| **flag)
            .map(|(index, _)| PieceIndex::new(index as u32))
            .collect()
    }

    pub fn completed_count(&self) -> usize {
        self.flags.iter().filter(|flag| **flag).count()
    }

    /// True once every piece is flagged.
    pub fn is_complete(&self) -> bool {
        self.flags.iter().all(|flag| *flag)
    }

    /// Serialized form: one byte per piece.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.flags
            .iter()
            .map(|flag| if *flag { VERIFIED } else { MISSING })
            .collect()
    }

    /// Rewrites the side file with the current flags.
    ///
    /// # Errors
    ///
    /// - `StorageError::ResumeFile` - If the file cannot be written
    pub async fn persist(&self) -> Result<(), StorageError> {
        tokio::fs::write(&self.path, self.to_bytes())
            .await
            .map_err(|e| StorageError::ResumeFile {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_missing_file_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let state = ResumeState::load(dir.path().join("movie.mkv-config.txt"), 4)
            .await
            .unwrap();

        assert_eq!(state.completed_count(), 0);
        assert!(!state.is_complete());
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv-config.txt");

        let mut state = ResumeState::new(&path, 5);
        state.mark(PieceIndex::new(1));
        state.mark(PieceIndex::new(4));
        state.persist().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0, 1, 0, 0, 1]);

        let loaded = ResumeState::load(&path, 5).await.unwrap();
        assert_eq!(
            loaded.completed_indices(),
            vec![PieceIndex::new(1), PieceIndex::new(4)]
        );
    }

    #[tokio::test]
    async fn test_short_file_leaves_tail_incomplete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data-config.txt");
        std::fs::write(&path, [1, 1]).unwrap();

        let state = ResumeState::load(&path, 4).await.unwrap();

        assert!(state.is_verified(PieceIndex::new(0)));
        assert!(state.is_verified(PieceIndex::new(1)));
        assert!(!state.is_verified(PieceIndex::new(2)));
        assert!(!state.is_verified(PieceIndex::new(3)));
    }

    #[test]
    fn test_mark_out_of_range() {
        let mut state = ResumeState::new("unused", 2);
        assert!(!state.mark(PieceIndex::new(2)));
        assert!(state.mark(PieceIndex::new(1)));
        state.clear(PieceIndex::new(1));
        assert_eq!(state.to_bytes(), vec![0, 0]);
    }
}
