//! Port definitions (trait abstractions) consumed by the downloader engine.
//!
//! The engine receives its storage behind this trait so the download crate
//! never depends on the database crate; the repository implementation is
//! injected at the composition root.

use async_trait::async_trait;

use crate::download::{DownloadItem, DownloadOutcome};
use crate::error::StorageError;

/// Storage operations the download engine needs.
#[async_trait]
pub trait DownloadItemStore: Send + Sync {
    /// Atomically transition up to `limit` items from Enqueued to
    /// Downloading and return them.
    async fn pull_next_enqueued(&self, limit: u32) -> Result<Vec<DownloadItem>, StorageError>;

    /// Record the terminal outcome for one item in a single transaction.
    async fn write_outcome(
        &self,
        normalized_url: &str,
        outcome: &DownloadOutcome,
    ) -> Result<(), StorageError>;

    /// Put an in-flight item back to Enqueued (engine stop, crash recovery).
    async fn requeue(&self, normalized_url: &str) -> Result<(), StorageError>;

    /// Flip every Downloading row back to Enqueued; returns how many.
    async fn requeue_stalled(&self) -> Result<u64, StorageError>;
}
