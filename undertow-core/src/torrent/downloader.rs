//! Download coordinator.
//!
//! Drives the tracker announces, starts one outbound session per new peer
//! address and runs a selection round every poll interval until the store
//! reports every piece verified.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;

use super::peer_directory::PeerDirection;
use super::peer_session::{PeerSession, SessionContext, SessionEnd};
use super::tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
use super::TorrentError;

/// Outcome of one coordinated download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Verified pieces at the end of the run
    pub pieces_completed: u32,
    pub piece_count: u32,
    /// Payload bytes received from peers this run
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    /// Distinct peer addresses an outbound session was started for
    pub peers_contacted: usize,
    /// Selection rounds run
    pub rounds: u32,
    pub elapsed: Duration,
}

type SessionResult = (SocketAddr, Result<SessionEnd, TorrentError>);

/// Control loop tying tracker, sessions and selection rounds together.
pub struct DownloadCoordinator {
    tracker: Arc<dyn TrackerClient>,
    context: SessionContext,
    /// Address we announce; never dialled
    own_address: SocketAddr,
    uploaded: Arc<AtomicU64>,
    total_length: u64,
    sessions: JoinSet<SessionResult>,
    contacted: HashSet<SocketAddr>,
    rounds: u32,
}

impl std::fmt::Debug for DownloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadCoordinator")
            .field("tracker", &self.tracker.tracker_url())
            .field("own_address", &self.own_address)
            .field("sessions", &self.sessions.len())
            .field("rounds", &self.rounds)
            .finish()
    }
}

impl DownloadCoordinator {
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        context: SessionContext,
        own_address: SocketAddr,
        uploaded: Arc<AtomicU64>,
        total_length: u64,
    ) -> Self {
        Self {
            tracker,
            context,
            own_address,
            uploaded,
            total_length,
            sessions: JoinSet::new(),
            contacted: HashSet::new(),
            rounds: 0,
        }
    }

    /// Runs until every piece is verified or shutdown is signalled.
    ///
    /// Only the initial `started` announce is fatal; later announce failures
    /// are logged and retried on the next poll.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerConnectionFailed` / `TorrentError::TrackerFailure` - Initial announce failed
    pub async fn run(mut self) -> Result<DownloadSummary, TorrentError> {
        let started = Instant::now();
        let store = Arc::clone(&self.context.store);

        if store.is_complete() {
            tracing::info!("All pieces already present, nothing to download");
            self.announce_logged(Some(AnnounceEvent::Completed)).await;
            return Ok(self.summary(started));
        }

        let response = self.announce(Some(AnnounceEvent::Started)).await?;
        self.spawn_sessions(&response.peers);

        let poll_interval = self.context.network.poll_interval;
        let mut completion = store.subscribe_completion();
        let mut shutdown = self.context.shutdown.clone();

        let mut engine_gone = false;
        loop {
            let complete = *completion.borrow();
            let stopping = *shutdown.borrow();
            if complete || stopping || engine_gone {
                break;
            }

            self.run_selection_round(poll_interval).await;

            let finished = tokio::select! {
                done = tokio::time::timeout(poll_interval, wait_for_completion(&mut completion)) => {
                    matches!(done, Ok(true))
                }
                changed = shutdown.changed() => {
                    engine_gone = changed.is_err();
                    false
                }
            };
            self.reap_sessions();
            let stopping = *shutdown.borrow();
            if finished || stopping || engine_gone {
                continue;
            }

            tracing::info!(
                "{}% complete, {} sessions active, re-announcing",
                store.percent_complete(),
                self.sessions.len()
            );
            if let Some(response) = self.announce_logged(None).await {
                self.spawn_sessions(&response.peers);
            }
        }

        if store.is_complete() {
            tracing::info!("Download complete after {:?}", started.elapsed());
            self.context.picker.finish_all();
            self.context.directory.mark_all_completed();
            self.announce_logged(Some(AnnounceEvent::Completed)).await;
        }

        while let Some(joined) = self.sessions.join_next().await {
            log_session(joined);
        }
        Ok(self.summary(started))
    }

    async fn run_selection_round(&mut self, poll_interval: Duration) {
        let picker = &self.context.picker;
        if !picker.wait_for_peer_bitfields(poll_interval).await {
            tracing::debug!("Not every peer reported its pieces, selecting anyway");
        }
        let handed_out = picker.select_assignments(self.context.store.remaining_work());
        self.rounds += 1;
        tracing::info!(
            "Selection round {}: {} pieces assigned across {} peers",
            self.rounds,
            handed_out,
            picker.peer_count()
        );
    }

    fn spawn_sessions(&mut self, peers: &[SocketAddr]) {
        // Ended sessions must not count against the peer limit
        self.reap_sessions();
        for &address in peers {
            if address == self.own_address {
                continue;
            }
            if self.sessions.len() >= self.context.network.max_peer_connections {
                tracing::debug!("Peer limit reached, skipping {}", address);
                break;
            }
            if self.context.directory.contains(address) || !self.context.picker.register_peer(address) {
                continue;
            }
            self.context.directory.register(address, PeerDirection::Outbound);
            self.contacted.insert(address);

            let context = self.context.clone();
            self.sessions
                .spawn(async move { (address, PeerSession::run(address, context).await) });
            tracing::debug!("Started session for {}", address);
        }
    }

    fn reap_sessions(&mut self) {
        while let Some(joined) = self.sessions.try_join_next() {
            log_session(joined);
        }
    }

    fn request(&self, event: Option<AnnounceEvent>) -> AnnounceRequest {
        let store = &self.context.store;
        let left = store.left_bytes();
        AnnounceRequest {
            info_hash: self.context.info_hash,
            peer_id: self.context.peer_id,
            port: self.own_address.port(),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.total_length.saturating_sub(left),
            left,
            event,
        }
    }

    async fn announce(
        &self,
        event: Option<AnnounceEvent>,
    ) -> Result<AnnounceResponse, TorrentError> {
        self.tracker.announce(self.request(event)).await
    }

    async fn announce_logged(&self, event: Option<AnnounceEvent>) -> Option<AnnounceResponse> {
        match self.announce(event).await {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::warn!("Announce to {} failed: {}", self.tracker.tracker_url(), e);
                None
            }
        }
    }

    fn summary(&self, started: Instant) -> DownloadSummary {
        let store = &self.context.store;
        DownloadSummary {
            pieces_completed: store.completed_count(),
            piece_count: store.piece_count(),
            bytes_downloaded: store.downloaded_bytes(),
            bytes_uploaded: self.uploaded.load(Ordering::Relaxed),
            peers_contacted: self.contacted.len(),
            rounds: self.rounds,
            elapsed: started.elapsed(),
        }
    }
}

/// Resolves true once the store reports completion, false if the store is gone.
async fn wait_for_completion(completion: &mut watch::Receiver<bool>) -> bool {
    loop {
        let complete = *completion.borrow_and_update();
        if complete {
            return true;
        }
        if completion.changed().await.is_err() {
            return false;
        }
    }
}

fn log_session(joined: Result<SessionResult, tokio::task::JoinError>) {
    match joined {
        Ok((address, Ok(end))) => tracing::debug!("Session {} finished: {:?}", address, end),
        Ok((address, Err(e))) => tracing::debug!("Session {} failed: {}", address, e),
        Err(e) => tracing::error!("Session task panicked: {}", e),
    }
}
