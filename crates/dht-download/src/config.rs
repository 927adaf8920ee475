//! Engine configuration.

use std::time::Duration;

/// Tunables for the download engine.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Parallel workers fetching items.
    pub concurrency: u32,
    /// Items claimed from the store per dispatcher query.
    pub batch_size: u32,
    /// Per-request deadline.
    pub request_timeout: Duration,
    /// Skip items whose declared or accumulated size exceeds this.
    pub size_cap_bytes: Option<u64>,
    /// How long the dispatcher sleeps when the queue is empty.
    pub idle_poll_interval: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 16,
            request_timeout: Duration::from_secs(30),
            size_cap_bytes: None,
            idle_poll_interval: Duration::from_millis(250),
        }
    }
}
