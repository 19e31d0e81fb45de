//! End-to-end downloads against in-process seeders.
//!
//! Each seeder is a bare listening server over a store that holds only part
//! of the file, so a complete download needs blocks from every seeder.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use undertow_core::config::UndertowConfig;
use undertow_core::storage::ResumeState;
use undertow_core::torrent::parsing::BencodeTorrentParser;
use undertow_core::torrent::{
    AnnounceRequest, AnnounceResponse, PeerDirectory, PeerId, PeerServer, PieceIndex, PieceStore,
    SelectionKind, TorrentDescriptor, TorrentEngine, TorrentError, TorrentParser, TrackerClient,
};

const PIECE_LENGTH: usize = 16_384;

/// Tracker that always hands out the same peers.
#[derive(Debug)]
struct StaticTracker {
    peers: Vec<SocketAddr>,
}

#[async_trait]
impl TrackerClient for StaticTracker {
    async fn announce(&self, _request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        Ok(AnnounceResponse {
            interval: Some(1),
            peers: self.peers.clone(),
        })
    }

    fn tracker_url(&self) -> &str {
        "mock://static"
    }
}

struct Seeder {
    address: SocketAddr,
    _shutdown: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

fn sample_content() -> Vec<u8> {
    (0..PIECE_LENGTH + 1000).map(|i| (i * 31 % 251) as u8).collect()
}

/// Bencodes a single-file torrent for `content`.
fn torrent_bytes(content: &[u8], name: &str) -> Vec<u8> {
    let announce = "http://127.0.0.1:1/announce";
    let pieces: Vec<u8> = content
        .chunks(PIECE_LENGTH)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect();

    let mut out = format!("d8:announce{}:{}4:infod", announce.len(), announce).into_bytes();
    out.extend_from_slice(
        format!(
            "6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
            content.len(),
            name.len(),
            name,
            PIECE_LENGTH,
            pieces.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(&pieces);
    out.extend_from_slice(b"ee");
    out
}

async fn parse_descriptor(dir: &Path, content: &[u8]) -> TorrentDescriptor {
    let path = dir.join("sample.torrent");
    tokio::fs::write(&path, torrent_bytes(content, "sample.bin"))
        .await
        .unwrap();
    BencodeTorrentParser::new()
        .parse_torrent_file(&path)
        .await
        .unwrap()
        .with_output_dir(dir)
}

async fn start_seeder(descriptor: &TorrentDescriptor, content: &[u8], pieces: &[u32]) -> Seeder {
    let (store, events) = PieceStore::new(descriptor);
    for &index in pieces {
        let index = PieceIndex::new(index);
        let start = descriptor.piece_offset(index) as usize;
        let end = start + descriptor.piece_size(index) as usize;
        let restored = store
            .restore_piece(index, &Bytes::copy_from_slice(&content[start..end]))
            .unwrap();
        assert!(restored);
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = PeerServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(store),
        Arc::new(PeerDirectory::new()),
        descriptor.info_hash,
        PeerId::generate("-SD0001-"),
        events.have_notifications,
        shutdown_rx,
    )
    .await
    .unwrap();
    let address = server.local_addr().unwrap();

    Seeder {
        address,
        _shutdown: shutdown,
        _task: tokio::spawn(server.run()),
    }
}

async fn download_with(selection: SelectionKind) {
    let dir = TempDir::new().unwrap();
    let content = sample_content();
    let descriptor = parse_descriptor(dir.path(), &content).await;
    assert_eq!(descriptor.piece_count(), 2);

    let first = start_seeder(&descriptor, &content, &[0]).await;
    let second = start_seeder(&descriptor, &content, &[1]).await;

    let mut config = UndertowConfig::for_testing();
    config.torrent.selection = selection;
    let output_path = descriptor.output_path.clone();
    let resume_path = descriptor.resume_path(config.storage.resume_suffix);

    let handle = TorrentEngine::new(descriptor, config)
        .with_listen_address("127.0.0.1:0".parse().unwrap())
        .with_tracker(Arc::new(StaticTracker {
            peers: vec![first.address, second.address],
        }))
        .start()
        .await
        .unwrap();
    let store = Arc::clone(handle.store());

    let summary = timeout(Duration::from_secs(20), handle.finish())
        .await
        .expect("download timed out")
        .unwrap();

    assert_eq!(store.percent_complete(), 100);
    assert_eq!(summary.pieces_completed, 2);
    assert_eq!(summary.peers_contacted, 2);
    assert_eq!(summary.bytes_downloaded, content.len() as u64);

    let written = tokio::fs::read(&output_path).await.unwrap();
    assert_eq!(&written[..PIECE_LENGTH], &content[..PIECE_LENGTH]);
    assert_eq!(&written[PIECE_LENGTH..], &content[PIECE_LENGTH..]);

    let resume = ResumeState::load(resume_path, 2).await.unwrap();
    assert!(resume.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_from_two_seeders_rarest_first() {
    download_with(SelectionKind::RarestFirst).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_from_two_seeders_sequential() {
    download_with(SelectionKind::Sequential).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_from_two_seeders_load_balanced() {
    download_with(SelectionKind::LoadBalanced).await;
}

#[tokio::test]
async fn test_second_run_resumes_without_peers() {
    let dir = TempDir::new().unwrap();
    let content = sample_content();
    let descriptor = parse_descriptor(dir.path(), &content).await;
    let config = UndertowConfig::for_testing();

    tokio::fs::write(&descriptor.output_path, &content).await.unwrap();
    tokio::fs::write(descriptor.resume_path(config.storage.resume_suffix), [1u8, 1])
        .await
        .unwrap();

    let handle = TorrentEngine::new(descriptor, config)
        .with_listen_address("127.0.0.1:0".parse().unwrap())
        .with_tracker(Arc::new(StaticTracker { peers: Vec::new() }))
        .start()
        .await
        .unwrap();

    let summary = timeout(Duration::from_secs(5), handle.finish())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.pieces_completed, 2);
    assert_eq!(summary.bytes_downloaded, 0);
    assert_eq!(summary.peers_contacted, 0);
}
