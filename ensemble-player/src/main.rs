//! Ensemble Player daemon
//!
//! Brings up the playback engine with the cpal local sink and the shared
//! database. Remote receiver streaming requires a driver backend; without
//! one, playback stays local.

use clap::Parser;
use ensemble_player::audio::CpalSink;
use ensemble_player::player::registry::DeviceRegistry;
use ensemble_player::raop::NullBackend;
use ensemble_player::transcode::MediaTranscodeFactory;
use ensemble_player::{Player, PlayerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ensemble multi-room audio player
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root folder path (overrides the ENSEMBLE_ROOT environment variable)
    #[arg(short, long, value_name = "PATH")]
    root_folder: Option<PathBuf>,

    /// Audio output device name (default: system default output)
    #[arg(short, long, value_name = "DEVICE")]
    device: Option<String>,

    /// Display name for the local output
    #[arg(long, value_name = "NAME", default_value = "Computer")]
    local_name: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ensemble_player={},ensemble_common={}", log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Ensemble Player starting...");

    let root_folder = ensemble_common::config::resolve_root_folder(
        args.root_folder.as_deref().and_then(|p| p.to_str()),
        "ENSEMBLE_ROOT",
    )?;
    info!("Root folder: {}", root_folder.display());
    std::fs::create_dir_all(&root_folder)?;

    let db = ensemble_common::db::init_database(&root_folder.join("ensemble.db")).await?;

    let registry = Arc::new(DeviceRegistry::new());

    // No remote driver wired up in this build; the sender stays alive so
    // the session event channel never closes.
    let (_session_tx, session_rx) = mpsc::unbounded_channel();

    let device = args.device.clone();
    let player = Player::launch(PlayerConfig {
        db,
        registry,
        backend: Arc::new(NullBackend),
        session_events: session_rx,
        sink_factory: Box::new(move |events| Box::new(CpalSink::new(device, events))),
        transcode: Arc::new(MediaTranscodeFactory),
        local_name: args.local_name,
    })?;

    info!("Player ready");

    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    player.shutdown().await;

    Ok(())
}
