//! Startup validation and the download command

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use undertow_core::config::UndertowConfig;
use undertow_core::torrent::parsing::BencodeTorrentParser;
use undertow_core::torrent::{
    DownloadSummary, PeerDirectory, PieceStore, TorrentDescriptor, TorrentEngine, TorrentParser,
};
use undertow_core::{Result, UndertowError};

use crate::Cli;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Validates the arguments, runs the download and optionally keeps seeding.
///
/// # Errors
/// - `UndertowError::Configuration` - Download directory missing or `--ip` unresolvable
/// - `UndertowError::Torrent` - Torrent file invalid or the download failed
pub async fn run(cli: Cli) -> Result<()> {
    let descriptor = load_descriptor(&cli.torrent, &cli.download_dir).await?;
    let config = build_config(&cli);
    let listen_address = resolve_listen_address(cli.ip.as_deref(), config.network.listen_port).await?;

    println!(
        "Downloading {} ({} pieces, {} bytes) to {}",
        descriptor.name,
        descriptor.piece_count(),
        descriptor.total_length,
        descriptor.output_path.display()
    );

    let handle = TorrentEngine::new(descriptor, config)
        .with_listen_address(listen_address)
        .start()
        .await?;

    let status = cli.info.then(|| {
        tokio::spawn(report_status(
            Arc::clone(handle.store()),
            Arc::clone(handle.directory()),
        ))
    });

    let result = if cli.seed {
        handle
            .seed(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Ctrl-C handler unavailable: {}", e);
                }
            })
            .await
    } else {
        tokio::select! {
            result = handle.finish() => result,
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted; verified pieces are kept for the next run");
                return Ok(());
            }
        }
    };

    if let Some(status) = status {
        status.abort();
    }
    print_summary(&result?);
    Ok(())
}

/// Reads the torrent file and places its output inside `download_dir`.
///
/// # Errors
/// - `UndertowError::Configuration` - `download_dir` is not an existing directory
/// - `UndertowError::Torrent` - Torrent file unreadable or invalid
pub async fn load_descriptor(torrent: &Path, download_dir: &Path) -> Result<TorrentDescriptor> {
    if !download_dir.is_dir() {
        return Err(UndertowError::Configuration {
            reason: format!("download directory {} does not exist", download_dir.display()),
        });
    }
    let descriptor = BencodeTorrentParser::new()
        .parse_torrent_file(torrent)
        .await?;
    Ok(descriptor.with_output_dir(download_dir))
}

/// Resolves `--ip` to the address the server binds, all interfaces if absent.
///
/// # Errors
/// - `UndertowError::Configuration` - Host name does not resolve
pub async fn resolve_listen_address(ip: Option<&str>, port: u16) -> Result<SocketAddr> {
    let Some(host) = ip else {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    };
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(address, port));
    }

    let unresolvable = || UndertowError::Configuration {
        reason: format!("cannot resolve listen address {host}"),
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| unresolvable())?
        .next()
        .ok_or_else(unresolvable)
}

fn build_config(cli: &Cli) -> UndertowConfig {
    let mut config = UndertowConfig::from_env();
    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }
    if let Some(strategy) = cli.strategy {
        config.torrent.selection = strategy;
    }
    config
}

async fn report_status(store: Arc<PieceStore>, directory: Arc<PeerDirectory>) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    loop {
        interval.tick().await;
        println!(
            "[{:>3}%] {}/{} pieces, {} peers connected",
            store.percent_complete(),
            store.completed_count(),
            store.piece_count(),
            directory.connected_count()
        );
    }
}

fn print_summary(summary: &DownloadSummary) {
    println!(
        "Finished: {}/{} pieces, {} bytes downloaded, {} bytes uploaded, {} peers contacted in {:.1}s",
        summary.pieces_completed,
        summary.piece_count,
        summary.bytes_downloaded,
        summary.bytes_uploaded,
        summary.peers_contacted,
        summary.elapsed.as_secs_f64()
    );
}
