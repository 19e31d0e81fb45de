//! Undertow Core - peer-wire download engine
//!
//! This crate provides the building blocks of a BitTorrent download client:
//! the wire codec, the shared piece store with SHA-1 verification, pluggable
//! piece selection, outbound peer sessions, the listening server, the disk
//! writer and the coordinator that ties them together.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use storage::StorageError;
pub use torrent::{TorrentEngine, TorrentError};

/// Core errors that can bubble up from any Undertow subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::TrackerFailure { reason } => {
                    format!("Tracker rejected the announce: {reason}")
                }
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Storage(_) => "Storage error occurred".to_string(),
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        let invalid = UndertowError::from(TorrentError::InvalidTorrentFile {
            reason: "missing info".to_string(),
        });
        assert!(invalid.is_user_error());
        assert_eq!(invalid.user_message(), "Invalid torrent file: missing info");

        let config = UndertowError::Configuration {
            reason: "download directory does not exist".to_string(),
        };
        assert!(config.is_user_error());

        let io = UndertowError::from(std::io::Error::other("disk full"));
        assert!(!io.is_user_error());
        assert_eq!(io.user_message(), "File system error occurred");
    }
}
