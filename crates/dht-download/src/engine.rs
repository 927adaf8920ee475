//! Engine lifecycle: dispatcher, worker pool, stop semantics.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use dht_core::{DownloadItem, DownloadItemStore, DownloadOutcome, FinishedDownload};

use crate::config::DownloaderConfig;
use crate::fetch::fetch_item;

/// Engine lifecycle errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("downloader is already running")]
    AlreadyRunning,

    #[error("http client: {0}")]
    Client(String),
}

struct RunningState {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The download engine.
///
/// Owns its storage behind [`DownloadItemStore`]; events flow outward
/// through the finished-items stream rather than the store calling back in.
pub struct Downloader {
    store: Arc<dyn DownloadItemStore>,
    config: DownloaderConfig,
    client: reqwest::Client,
    state: Mutex<Option<RunningState>>,
}

impl Downloader {
    pub fn new(
        store: Arc<dyn DownloadItemStore>,
        config: DownloaderConfig,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| EngineError::Client(e.to_string()))?;

        Ok(Self {
            store,
            config,
            client,
            state: Mutex::new(None),
        })
    }

    /// Transition Idle → Running.
    ///
    /// Returns the finished-items stream: one element per completed item,
    /// success, failure or skip alike. The stream ends when the engine
    /// stops and the last worker exits.
    pub async fn start(
        &self,
    ) -> Result<UnboundedReceiverStream<FinishedDownload>, EngineError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel::<DownloadItem>(self.config.batch_size as usize);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut tasks = Vec::with_capacity(self.config.concurrency as usize + 1);
        tasks.push(tokio::spawn(run_dispatcher(
            Arc::clone(&self.store),
            self.config.clone(),
            work_tx,
            cancel.clone(),
        )));
        for worker_id in 0..self.config.concurrency {
            tasks.push(tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&self.store),
                self.client.clone(),
                self.config.size_cap_bytes,
                Arc::clone(&work_rx),
                finished_tx.clone(),
                cancel.clone(),
            )));
        }

        *state = Some(RunningState { cancel, tasks });
        tracing::info!(
            workers = self.config.concurrency,
            batch = self.config.batch_size,
            "downloader started"
        );
        Ok(UnboundedReceiverStream::new(finished_rx))
    }

    /// Transition Running → Idle.
    ///
    /// Cancels in-flight fetches, waits for every worker to exit, then
    /// resolves. Items caught mid-flight go back to Enqueued. A no-op
    /// when already idle.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        tracing::info!("downloader stopped");
    }

    pub async fn is_downloading(&self) -> bool {
        self.state.lock().await.is_some()
    }
}

/// Pull batches of enqueued items and feed them to the workers.
async fn run_dispatcher(
    store: Arc<dyn DownloadItemStore>,
    config: DownloaderConfig,
    work_tx: mpsc::Sender<DownloadItem>,
    cancel: CancellationToken,
) {
    // Rows orphaned as Downloading by a crash or previous stop get
    // another chance before the first pull.
    if let Err(error) = store.requeue_stalled().await {
        tracing::warn!(%error, "could not requeue stalled items");
    }

    'dispatch: while !cancel.is_cancelled() {
        let items = match store.pull_next_enqueued(config.batch_size).await {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(%error, "pulling enqueued items failed");
                Vec::new()
            }
        };

        if items.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => break 'dispatch,
                () = tokio::time::sleep(config.idle_poll_interval) => {}
            }
            continue;
        }

        let mut pending: std::collections::VecDeque<DownloadItem> = items.into();
        while let Some(item) = pending.pop_front() {
            tokio::select! {
                () = cancel.cancelled() => {
                    pending.push_front(item);
                    requeue_batch(&store, pending).await;
                    break 'dispatch;
                }
                sent = work_tx.send(item.clone()) => {
                    if sent.is_err() {
                        // All workers gone; put the batch back
                        pending.push_front(item);
                        requeue_batch(&store, pending).await;
                        break 'dispatch;
                    }
                }
            }
        }
    }
}

/// Fetch items until cancelled or the dispatcher goes away.
async fn run_worker(
    worker_id: u32,
    store: Arc<dyn DownloadItemStore>,
    client: reqwest::Client,
    size_cap_bytes: Option<u64>,
    work_rx: Arc<Mutex<mpsc::Receiver<DownloadItem>>>,
    finished_tx: mpsc::UnboundedSender<FinishedDownload>,
    cancel: CancellationToken,
) {
    loop {
        // Hold the receiver lock only while waiting for an item
        let item = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                () = cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { break };

        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                // Engine stop is not a failure; hand the item back
                requeue_one(&store, &item.normalized_url).await;
                tracing::debug!(worker_id, url = %item.normalized_url, "fetch cancelled by stop");
                break;
            }
            outcome = fetch_item(&client, &item, size_cap_bytes) => outcome,
        };

        let finished = FinishedDownload {
            normalized_url: item.normalized_url.clone(),
            status: outcome.status(),
            size: outcome_size(&outcome),
        };

        if let Err(error) = store.write_outcome(&item.normalized_url, &outcome).await {
            tracing::error!(url = %item.normalized_url, %error, "failed to record outcome");
            continue;
        }

        tracing::debug!(
            worker_id,
            url = %item.normalized_url,
            status = ?finished.status,
            "download finished"
        );
        // Receiver may be gone; the engine keeps draining regardless
        let _ = finished_tx.send(finished);
    }
}

async fn requeue_one(store: &Arc<dyn DownloadItemStore>, normalized_url: &str) {
    if let Err(error) = store.requeue(normalized_url).await {
        tracing::warn!(url = %normalized_url, %error, "could not requeue item");
    }
}

async fn requeue_batch(
    store: &Arc<dyn DownloadItemStore>,
    pending: std::collections::VecDeque<DownloadItem>,
) {
    for item in pending {
        requeue_one(store, &item.normalized_url).await;
    }
}

fn outcome_size(outcome: &DownloadOutcome) -> Option<u64> {
    match outcome {
        DownloadOutcome::Success { blob, .. } => Some(blob.len() as u64),
        DownloadOutcome::Skipped { size } => *size,
        DownloadOutcome::Failed { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dht_core::StorageError;

    struct EmptyStore;

    #[async_trait]
    impl DownloadItemStore for EmptyStore {
        async fn pull_next_enqueued(
            &self,
            _limit: u32,
        ) -> Result<Vec<DownloadItem>, StorageError> {
            Ok(Vec::new())
        }

        async fn write_outcome(
            &self,
            _normalized_url: &str,
            _outcome: &DownloadOutcome,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        async fn requeue(&self, _normalized_url: &str) -> Result<(), StorageError> {
            Ok(())
        }

        async fn requeue_stalled(&self) -> Result<u64, StorageError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn lifecycle_idle_running_idle() {
        let downloader =
            Downloader::new(Arc::new(EmptyStore), DownloaderConfig::default()).unwrap();
        assert!(!downloader.is_downloading().await);

        let _finished = downloader.start().await.unwrap();
        assert!(downloader.is_downloading().await);

        downloader.stop().await;
        assert!(!downloader.is_downloading().await);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let downloader =
            Downloader::new(Arc::new(EmptyStore), DownloaderConfig::default()).unwrap();
        let _finished = downloader.start().await.unwrap();
        assert!(matches!(
            downloader.start().await,
            Err(EngineError::AlreadyRunning)
        ));
        downloader.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let downloader =
            Downloader::new(Arc::new(EmptyStore), DownloaderConfig::default()).unwrap();
        downloader.stop().await;
        assert!(!downloader.is_downloading().await);
    }

    #[tokio::test]
    async fn stream_ends_after_stop() {
        use futures_util::StreamExt;

        let downloader =
            Downloader::new(Arc::new(EmptyStore), DownloaderConfig::default()).unwrap();
        let mut finished = downloader.start().await.unwrap();
        downloader.stop().await;
        assert!(finished.next().await.is_none());
    }
}
