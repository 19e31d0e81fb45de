//! Undertow CLI - download a single torrent from the command line

mod commands;

use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use undertow_core::torrent::SelectionKind;
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

/// Command-line arguments for a single download.
#[derive(Debug, Parser)]
#[command(name = "undertow")]
#[command(about = "Peer-wire BitTorrent download client")]
#[command(version)]
pub struct Cli {
    /// Path to the .torrent file
    pub torrent: PathBuf,

    /// Existing directory the file is written into
    pub download_dir: PathBuf,

    /// Console log level (RUST_LOG overrides it)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,

    /// Shorthand for --log-level debug
    #[arg(long)]
    pub debug: bool,

    /// Print connected peers and completion every second
    #[arg(long)]
    pub info: bool,

    /// Address or host name the listening server binds and announces
    #[arg(long)]
    pub ip: Option<String>,

    /// Listening port (defaults to UNDERTOW_LISTEN_PORT or 6883)
    #[arg(long)]
    pub port: Option<u16>,

    /// Piece selection policy
    #[arg(long, value_enum)]
    pub strategy: Option<SelectionKind>,

    /// Keep serving peers after the download completes, until Ctrl-C
    #[arg(long)]
    pub seed: bool,

    /// Directory for the run log (defaults to ./logs)
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,
}

impl Cli {
    fn console_level(&self) -> CliLogLevel {
        if self.debug {
            CliLogLevel::Debug
        } else {
            self.log_level
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.console_level().as_tracing_level(), cli.logs_dir.as_deref()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match commands::run(cli).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_user_error() => {
            eprintln!("{}", e.user_message());
            eprintln!();
            eprintln!("{}", Cli::command().render_usage());
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::Error::new(e).context("Download failed")),
    }
}
