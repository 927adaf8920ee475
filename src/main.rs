//! Composition root: CLI flags, tracing, wiring, graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dht_db::{AlwaysUpgrade, Database, DatabaseOpenResult};
use dht_download::{Downloader, DownloaderConfig};
use dht_server::{start_server, ServerConfig, DEFAULT_MAX_BODY_BYTES};

/// Companion process for the browser-side chat history tracker.
#[derive(Debug, Parser)]
#[command(name = "dht", version, about)]
struct Args {
    /// Path to the archive database file.
    #[arg(long)]
    db: PathBuf,

    /// Port for the ingest endpoint; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Session token; a random one is generated when absent.
    #[arg(long)]
    token: Option<String>,

    /// Parallel attachment download workers.
    #[arg(long, default_value_t = 4)]
    concurrency: u32,

    /// Skip attachments larger than this many bytes.
    #[arg(long)]
    size_cap_bytes: Option<u64>,

    /// Per-download request deadline in seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Maximum ingest request body size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Start draining the download queue immediately.
    #[arg(long)]
    download: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let db = match Database::open(&args.db, &AlwaysUpgrade)
        .await
        .with_context(|| format!("opening archive at {}", args.db.display()))?
    {
        DatabaseOpenResult::Opened(db) => Arc::new(db),
        DatabaseOpenResult::UpgradeRefused => bail!("archive upgrade refused"),
    };

    let token = args
        .token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let server_config = ServerConfig {
        port: args.port,
        token,
        max_body_bytes: args.max_body_bytes,
    };
    let (info, server_handle) = start_server(Arc::clone(&db), server_config)
        .await
        .context("binding ingest endpoint")?;

    println!("listening on http://{}", info.addr);
    println!("token: {}", info.token);

    let downloader = Downloader::new(
        db.downloads().clone(),
        DownloaderConfig {
            concurrency: args.concurrency,
            size_cap_bytes: args.size_cap_bytes,
            request_timeout: Duration::from_secs(args.timeout_secs),
            ..DownloaderConfig::default()
        },
    )
    .map_err(|e| anyhow::anyhow!("building downloader: {e}"))?;

    if args.download {
        let finished = downloader
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("starting downloader: {e}"))?;
        let mut finished = finished.into_inner();
        tokio::spawn(async move {
            while let Some(item) = finished.recv().await {
                tracing::info!(
                    url = %item.normalized_url,
                    status = ?item.status,
                    size = ?item.size,
                    "download finished"
                );
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");

    downloader.stop().await;
    server_handle.abort();
    db.close().await;

    Ok(())
}
