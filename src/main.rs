mod cli;
mod config;
mod error;
mod metainfo;
mod peer_protocol;
mod peers;
mod piece_picker;
mod prelude;
mod storage;
mod swarm;
mod torrent;
mod tracker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use cli::Cli;
use config::SwarmConfig;
use metainfo::Metainfo;
use peers::SessionContext;
use piece_picker::{PiecePicker, PiecePickerHandle};
use prelude::*;
use storage::Storage;
use swarm::Swarm;
use torrent::PeerId;
use tracker::{request::TrackerRequest, HttpTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(SwarmConfig::from(&cli));
    let metainfo = Metainfo::from_bencode_file(&cli.source)?;
    let peer_id = PeerId::with_random_suffix();
    info!(%peer_id, name = metainfo.info.name(), "starting download");
    debug!(
        created_by = ?metainfo.created_by,
        comment = ?metainfo.comment,
        private = metainfo.info.is_private(),
        "torrent details"
    );

    let layout = metainfo.info.layout()?;
    let (piece_tx, piece_rx) = mpsc::unbounded_channel();
    let picker = PiecePickerHandle::new(
        PiecePicker::new(layout, metainfo.info.piece_hashes().to_vec())?,
        piece_tx,
    );

    let (storage, storage_handle) =
        Storage::create(&config.output_dir, &metainfo.info.files(), layout, piece_rx).await?;
    let storage_task = tokio::spawn(storage.run());

    let tracker_url = metainfo
        .http_tracker()
        .context("torrent has no http tracker, udp trackers are not supported")?;
    let tracker = HttpTracker::new(reqwest::Client::new(), tracker_url);
    let request = TrackerRequest::new(
        metainfo.info_hash,
        peer_id,
        config.port,
        tracker::bytes_left(&picker),
    );
    let response = tracker
        .announce(&request)
        .await
        .context("initial announce failed")?;

    let shutdown = CancellationToken::new();
    let (addr_tx, addr_rx) = mpsc::channel(4);
    let reannounce_task = tokio::spawn(tracker::reannounce(
        tracker,
        request,
        Duration::from_secs(response.request_interval_seconds.max(1)),
        picker.clone(),
        addr_tx,
        shutdown.clone(),
    ));

    let ctx = SessionContext {
        info_hash: metainfo.info_hash,
        peer_id,
        picker: picker.clone(),
        storage: storage_handle,
        config,
        shutdown: shutdown.clone(),
    };
    let swarm_result = Swarm::new(ctx, addr_rx)
        .run(response.peer_addresses.into_inner())
        .await;

    shutdown.cancel();
    reannounce_task.await?;
    let progress = picker.progress();
    // storage stops once the last picker handle is gone and every piece is written.
    drop(picker);
    storage_task.await??;

    swarm_result?;
    info!(?progress, "download finished");
    Ok(())
}
