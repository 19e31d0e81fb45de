//! Download engine wiring.
//!
//! [`TorrentEngine`] builds every shared component for one descriptor,
//! restores progress from the resume file and spawns the listening server,
//! the disk writer and the coordinator. The returned [`EngineHandle`] is how
//! callers observe progress and wait for the download to end.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::downloader::{DownloadCoordinator, DownloadSummary};
use super::parsing::TorrentDescriptor;
use super::peer_directory::PeerDirectory;
use super::peer_server::PeerServer;
use super::peer_session::SessionContext;
use super::piece_picker::PiecePicker;
use super::pieces::PieceStore;
use super::protocol::PeerId;
use super::tracker::{HttpTrackerClient, TrackerClient};
use super::{PieceIndex, TorrentError};
use crate::config::UndertowConfig;
use crate::storage::{DiskWriter, ResumeState, StorageError, WriterReport, read_piece_at};

/// Builder for a single-torrent download.
pub struct TorrentEngine {
    descriptor: TorrentDescriptor,
    config: UndertowConfig,
    peer_id: PeerId,
    listen_address: SocketAddr,
    tracker: Option<Arc<dyn TrackerClient>>,
}

impl std::fmt::Debug for TorrentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentEngine")
            .field("name", &self.descriptor.name)
            .field("info_hash", &self.descriptor.info_hash)
            .field("peer_id", &self.peer_id)
            .field("listen_address", &self.listen_address)
            .finish_non_exhaustive()
    }
}

impl TorrentEngine {
    /// Engine listening on every interface at the configured port.
    pub fn new(descriptor: TorrentDescriptor, config: UndertowConfig) -> Self {
        let peer_id = PeerId::generate(config.torrent.client_prefix);
        let listen_address = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            config.network.listen_port,
        );
        Self {
            descriptor,
            config,
            peer_id,
            listen_address,
            tracker: None,
        }
    }

    /// Binds and announces `address` instead of the default.
    pub fn with_listen_address(mut self, address: SocketAddr) -> Self {
        self.listen_address = address;
        self
    }

    /// Uses `tracker` instead of an HTTP client for the descriptor's announce URL.
    pub fn with_tracker(mut self, tracker: Arc<dyn TrackerClient>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Restores saved progress, binds the server and spawns every task.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - Listening address cannot be bound
    /// - `TorrentError::UrlParsing` / `TorrentError::TrackerConnectionFailed` - Announce URL unusable
    pub async fn start(self) -> Result<EngineHandle, TorrentError> {
        let descriptor = self.descriptor;
        let config = self.config;

        let tracker: Arc<dyn TrackerClient> = match self.tracker {
            Some(tracker) => tracker,
            None => Arc::new(HttpTrackerClient::new(
                descriptor.announce.clone(),
                &config.network,
            )?),
        };

        let (store, events) = PieceStore::new(&descriptor);
        let store = Arc::new(store);
        let resume = restore_progress(&descriptor, &config, &store).await;
        tracing::info!(
            "{}: {} of {} pieces already verified",
            descriptor.name,
            store.completed_count(),
            store.piece_count()
        );

        let directory = Arc::new(PeerDirectory::new());
        let picker = Arc::new(PiecePicker::new(config.torrent.selection));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (writer_stop_tx, writer_stop) = watch::channel(false);

        let server = PeerServer::bind(
            self.listen_address,
            Arc::clone(&store),
            Arc::clone(&directory),
            descriptor.info_hash,
            self.peer_id,
            events.have_notifications,
            shutdown.clone(),
        )
        .await?;
        let listen_address = server.local_addr()?;
        let uploaded = server.uploaded();
        let server = tokio::spawn(server.run());

        let writer = tokio::spawn(
            DiskWriter::new(
                descriptor.output_path.clone(),
                events.disk_queue,
                resume,
                writer_stop,
            )
            .run(),
        );

        let context = SessionContext {
            store: Arc::clone(&store),
            picker,
            directory: Arc::clone(&directory),
            info_hash: descriptor.info_hash,
            peer_id: self.peer_id,
            pieces_per_batch: config.storage.pieces_per_batch(descriptor.piece_length),
            network: config.network.clone(),
            shutdown,
        };
        let coordinator = tokio::spawn(
            DownloadCoordinator::new(
                tracker,
                context,
                listen_address,
                uploaded,
                descriptor.total_length,
            )
            .run(),
        );

        tracing::info!(
            "Started {} ({}) as {} on {} using {} selection",
            descriptor.name,
            descriptor.info_hash,
            self.peer_id,
            listen_address,
            config.torrent.selection
        );

        Ok(EngineHandle {
            store,
            directory,
            listen_address,
            shutdown: shutdown_tx,
            writer_stop: writer_stop_tx,
            coordinator,
            writer,
            server,
        })
    }
}

/// Loads the resume file and re-verifies every piece it claims.
///
/// Pieces whose bytes no longer hash correctly are cleared so they are
/// downloaded again.
async fn restore_progress(
    descriptor: &TorrentDescriptor,
    config: &UndertowConfig,
    store: &PieceStore,
) -> ResumeState {
    let path = descriptor.resume_path(&config.storage.resume_suffix);
    let piece_count = descriptor.piece_count() as usize;
    let mut resume = match ResumeState::load(&path, piece_count).await {
        Ok(resume) => resume,
        Err(e) => {
            tracing::warn!("Ignoring resume file: {}", e);
            ResumeState::new(path, piece_count)
        }
    };

    let mut cleared = 0;
    for index in resume.completed_indices() {
        if !restore_piece(descriptor, store, index).await {
            resume.clear(index);
            cleared += 1;
        }
    }
    if cleared > 0 {
        tracing::warn!("{} saved pieces failed verification and will be fetched again", cleared);
        if let Err(e) = resume.persist().await {
            tracing::warn!("Failed to rewrite resume file: {}", e);
        }
    }
    resume
}

async fn restore_piece(descriptor: &TorrentDescriptor, store: &PieceStore, index: PieceIndex) -> bool {
    let content = match read_piece_at(
        &descriptor.output_path,
        index,
        descriptor.piece_offset(index),
        descriptor.piece_size(index),
    )
    .await
    {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!("Saved piece {} unreadable: {}", index, e);
            return false;
        }
    };
    store.restore_piece(index, &content).unwrap_or(false)
}

/// Running engine.
#[derive(Debug)]
pub struct EngineHandle {
    store: Arc<PieceStore>,
    directory: Arc<PeerDirectory>,
    listen_address: SocketAddr,
    shutdown: watch::Sender<bool>,
    writer_stop: watch::Sender<bool>,
    coordinator: JoinHandle<Result<DownloadSummary, TorrentError>>,
    writer: JoinHandle<Result<WriterReport, StorageError>>,
    server: JoinHandle<()>,
}

impl EngineHandle {
    /// Address the listening server is bound to.
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn percent_complete(&self) -> u8 {
        self.store.percent_complete()
    }

    pub fn connected_peers(&self) -> usize {
        self.directory.connected_count()
    }

    /// Waits for the download and the last disk write, then stops the server.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` / `TorrentError::TrackerFailure` - Initial announce failed
    /// - `TorrentError::Io` - A background task panicked
    pub async fn finish(self) -> Result<DownloadSummary, TorrentError> {
        self.seed(std::future::ready(())).await
    }

    /// Like [`EngineHandle::finish`], but keeps serving peers until `until` resolves.
    ///
    /// # Errors
    ///
    /// See [`EngineHandle::finish`].
    pub async fn seed<F>(mut self, until: F) -> Result<DownloadSummary, TorrentError>
    where
        F: Future<Output = ()>,
    {
        let downloaded = join(&mut self.coordinator).await;
        if downloaded.is_err() {
            self.shutdown.send_replace(true);
        }
        // Every verified piece is queued before completion is observable
        self.writer_stop.send_replace(true);
        let report = join(&mut self.writer).await?;
        tracing::info!(
            "Wrote {} pieces ({} bytes), {} failed writes",
            report.pieces_written,
            report.bytes_written,
            report.failed_writes
        );

        if downloaded.is_ok() {
            until.await;
        }
        self.shutdown.send_replace(true);
        if let Err(e) = (&mut self.server).await {
            tracing::error!("Listening server task failed: {}", e);
        }
        downloaded
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(mut self) {
        self.shutdown.send_replace(true);
        if let Err(e) = join(&mut self.coordinator).await {
            tracing::debug!("Coordinator ended with: {}", e);
        }
        self.writer_stop.send_replace(true);
        if let Err(e) = join(&mut self.writer).await {
            tracing::debug!("Disk writer ended with: {}", e);
        }
        let _ = (&mut self.server).await;
    }
}

async fn join<T, E>(handle: &mut JoinHandle<Result<T, E>>) -> Result<T, TorrentError>
where
    TorrentError: From<E>,
{
    match handle.await {
        Ok(result) => result.map_err(TorrentError::from),
        Err(e) => Err(TorrentError::Io(std::io::Error::other(format!(
            "background task failed: {e}"
        )))),
    }
}
