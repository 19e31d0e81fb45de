//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::torrent::piece_picker::SelectionKind;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Eight-byte client prefix placed at the start of generated peer ids
    pub client_prefix: &'static str,
    /// Piece selection policy used by every selection round
    pub selection: SelectionKind,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_prefix: "-UT0001-",
            selection: SelectionKind::RarestFirst,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls socket timeouts, peer connection limits, the listening port
/// and tracker communication parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port the listening server binds and announces
    pub listen_port: u16,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent outbound peer sessions
    pub max_peer_connections: usize,
    /// TCP connect timeout for outbound sessions
    pub connect_timeout: Duration,
    /// Time allowed for the remote handshake to arrive
    pub handshake_timeout: Duration,
    /// Silence after which a single receive attempt is abandoned
    pub read_idle_timeout: Duration,
    /// Coordinator wait between completion checks, re-announces and selection rounds
    pub poll_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6883,
            tracker_timeout: Duration::from_secs(30),
            user_agent: "undertow/0.1.0",
            max_peer_connections: 50,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            read_idle_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Storage and request pipelining configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Bytes a session may have requested per batch; divided by piece length
    /// to get the number of pieces requested at once (never below one)
    pub max_in_flight_bytes: u64,
    /// Suffix appended to the output path to name the resume file
    pub resume_suffix: &'static str,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_in_flight_bytes: 1_000_000,
            resume_suffix: "-config.txt",
        }
    }
}

impl StorageConfig {
    /// Number of whole pieces a session requests before reading responses.
    pub fn pieces_per_batch(&self, piece_length: u32) -> usize {
        let per_batch = self.max_in_flight_bytes / u64::from(piece_length.max(1));
        usize::try_from(per_batch).unwrap_or(usize::MAX).max(1)
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("UNDERTOW_LISTEN_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.network.listen_port = port;
            }
        }

        if let Ok(timeout) = std::env::var("UNDERTOW_TRACKER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.network.tracker_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(max_peers) = std::env::var("UNDERTOW_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.network.max_peer_connections = count;
            }
        }

        if let Ok(interval) = std::env::var("UNDERTOW_POLL_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse::<u64>() {
                config.network.poll_interval = Duration::from_secs(seconds.max(1));
            }
        }

        if let Ok(selection) = std::env::var("UNDERTOW_SELECTION") {
            if let Ok(kind) = selection.parse::<SelectionKind>() {
                config.torrent.selection = kind;
            }
        }

        config
    }

    /// Creates a configuration with short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig {
                listen_port: 0,
                tracker_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
                handshake_timeout: Duration::from_secs(2),
                read_idle_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
