//! Repository for download items and archived blobs.
//!
//! `download_metadata` is keyed by normalized URL and carries the status
//! machine; `download_blobs` holds the bytes for successful items and is
//! removed by FK cascade whenever its metadata row goes away.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dht_core::{
    AttachmentFilter, CountObservable, CountPublisher, DownloadItem, DownloadItemFilter,
    DownloadItemStore, DownloadOutcome, DownloadStatus, DownloadStatusStatistics,
    DownloadStatusGroup, FilterRemovalMode, StorageError,
};

use super::storage_err;

/// One row of `download_metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub normalized_url: String,
    pub download_url: String,
    pub status: DownloadStatus,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

pub struct DownloadsRepository {
    pool: SqlitePool,
    total_count: CountPublisher,
}

impl DownloadsRepository {
    pub(crate) async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let repo = Self {
            pool,
            total_count: CountPublisher::default(),
        };
        repo.update_total_count().await?;
        Ok(repo)
    }

    /// Enqueue every attachment matching the filter whose normalized URL is
    /// not yet known to the download tables. Returns how many rows were
    /// inserted. Insert-or-ignore keeps this safe against a concurrently
    /// running engine.
    pub async fn enqueue_download_items(
        &self,
        filter: &AttachmentFilter,
    ) -> Result<u64, StorageError> {
        let mut sql = String::from(
            "INSERT OR IGNORE INTO download_metadata \
             (normalized_url, download_url, status, type, size) \
             SELECT a.normalized_url, a.download_url, ?, a.type, a.size \
             FROM attachments a WHERE 1 = 1",
        );

        if filter.max_bytes.is_some() {
            sql.push_str(" AND a.size <= ?");
        }
        if let Some(channels) = &filter.channel_ids {
            let placeholders = vec!["?"; channels.len()].join(", ");
            sql.push_str(&format!(
                " AND a.message_id IN \
                 (SELECT message_id FROM messages WHERE channel_id IN ({placeholders}))"
            ));
        }
        sql.push_str(
            " AND a.normalized_url NOT IN (SELECT normalized_url FROM download_metadata)",
        );

        let mut query = sqlx::query(&sql).bind(DownloadStatus::Enqueued.to_code());
        if let Some(max_bytes) = filter.max_bytes {
            query = query.bind(to_i64(max_bytes));
        }
        if let Some(channels) = &filter.channel_ids {
            for channel in channels {
                query = query.bind(channel.to_db());
            }
        }

        let inserted = query
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();

        if inserted > 0 {
            self.update_total_count().await?;
        }
        tracing::debug!(inserted, "enqueued download items");
        Ok(inserted)
    }

    /// Delete items by status group. Blob rows follow by FK cascade.
    pub async fn remove_download_items(
        &self,
        filter: &DownloadItemFilter,
        mode: FilterRemovalMode,
    ) -> Result<u64, StorageError> {
        let predicate = status_predicate(filter);
        let sql = match mode {
            FilterRemovalMode::RemoveMatching => {
                format!("DELETE FROM download_metadata WHERE {predicate}")
            }
            FilterRemovalMode::KeepMatching => {
                format!("DELETE FROM download_metadata WHERE NOT ({predicate})")
            }
        };

        let removed = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();

        if removed > 0 {
            self.update_total_count().await?;
        }
        tracing::debug!(removed, ?mode, "removed download items");
        Ok(removed)
    }

    /// Aggregate counts and byte totals per outcome bucket.
    pub async fn get_statistics(&self) -> Result<DownloadStatusStatistics, StorageError> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*), COALESCE(SUM(size), 0) \
             FROM download_metadata GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut stats = DownloadStatusStatistics::default();
        for (code, count, bytes) in rows {
            let status = DownloadStatus::from_code(code);
            let bucket = match status {
                DownloadStatus::Enqueued | DownloadStatus::Downloading => &mut stats.enqueued,
                DownloadStatus::Success => &mut stats.successful,
                DownloadStatus::Skipped => &mut stats.skipped,
                DownloadStatus::GenericError | DownloadStatus::Http(_) => &mut stats.failed,
            };
            bucket.count += from_i64(count);
            bucket.total_bytes += from_i64(bytes);
        }
        Ok(stats)
    }

    /// Atomically claim up to `limit` enqueued items for downloading.
    pub async fn pull_next_enqueued(&self, limit: u32) -> Result<Vec<DownloadItem>, StorageError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "UPDATE download_metadata SET status = ? \
             WHERE normalized_url IN \
               (SELECT normalized_url FROM download_metadata WHERE status = ? LIMIT ?) \
             RETURNING normalized_url, download_url",
        )
        .bind(DownloadStatus::Downloading.to_code())
        .bind(DownloadStatus::Enqueued.to_code())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|(normalized_url, download_url)| DownloadItem {
                normalized_url,
                download_url,
            })
            .collect())
    }

    /// Record a terminal outcome; on success the blob lands in the same
    /// transaction as the status flip.
    pub async fn write_outcome(
        &self,
        normalized_url: &str,
        outcome: &DownloadOutcome,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let updated = match outcome {
            DownloadOutcome::Success { blob, content_type } => {
                let updated = sqlx::query(
                    "UPDATE download_metadata \
                     SET status = ?, size = ?, type = COALESCE(?, type) \
                     WHERE normalized_url = ?",
                )
                .bind(DownloadStatus::Success.to_code())
                .bind(to_i64(blob.len() as u64))
                .bind(content_type)
                .bind(normalized_url)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?
                .rows_affected();

                if updated > 0 {
                    sqlx::query(
                        "INSERT INTO download_blobs (normalized_url, blob) VALUES (?, ?) \
                         ON CONFLICT (normalized_url) DO UPDATE SET blob = excluded.blob",
                    )
                    .bind(normalized_url)
                    .bind(blob.as_slice())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                updated
            }
            DownloadOutcome::Skipped { size } => sqlx::query(
                "UPDATE download_metadata SET status = ?, size = COALESCE(?, size) \
                 WHERE normalized_url = ?",
            )
            .bind(DownloadStatus::Skipped.to_code())
            .bind(size.map(to_i64))
            .bind(normalized_url)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?
            .rows_affected(),
            DownloadOutcome::Failed { status } => {
                sqlx::query("UPDATE download_metadata SET status = ? WHERE normalized_url = ?")
                    .bind(status.to_code())
                    .bind(normalized_url)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?
                    .rows_affected()
            }
        };

        if updated == 0 {
            return Err(StorageError::NotFound(format!(
                "download item {normalized_url}"
            )));
        }

        tx.commit().await.map_err(storage_err)
    }

    /// Serve an archived blob with its stored content type.
    pub async fn get_successful_blob(
        &self,
        normalized_url: &str,
    ) -> Result<Option<(Vec<u8>, Option<String>)>, StorageError> {
        let row: Option<(Vec<u8>, Option<String>)> = sqlx::query_as(
            "SELECT b.blob, m.type FROM download_blobs b \
             JOIN download_metadata m ON m.normalized_url = b.normalized_url \
             WHERE b.normalized_url = ? AND m.status = ?",
        )
        .bind(normalized_url)
        .bind(DownloadStatus::Success.to_code())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(row)
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM download_metadata")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    pub fn stream(&self) -> impl Stream<Item = Result<DownloadEntry, StorageError>> + Send + '_ {
        sqlx::query(
            "SELECT normalized_url, download_url, status, type, size \
             FROM download_metadata ORDER BY normalized_url",
        )
        .fetch(&self.pool)
        .map(|result| result.map_err(storage_err).and_then(|row| entry_from_row(&row)))
    }

    pub fn total_count(&self) -> CountObservable {
        self.total_count.subscribe()
    }

    async fn update_total_count(&self) -> Result<(), StorageError> {
        self.total_count.set(self.count().await?);
        Ok(())
    }
}

#[async_trait]
impl DownloadItemStore for DownloadsRepository {
    async fn pull_next_enqueued(&self, limit: u32) -> Result<Vec<DownloadItem>, StorageError> {
        Self::pull_next_enqueued(self, limit).await
    }

    async fn write_outcome(
        &self,
        normalized_url: &str,
        outcome: &DownloadOutcome,
    ) -> Result<(), StorageError> {
        Self::write_outcome(self, normalized_url, outcome).await
    }

    async fn requeue(&self, normalized_url: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE download_metadata SET status = ? WHERE normalized_url = ? AND status = ?")
            .bind(DownloadStatus::Enqueued.to_code())
            .bind(normalized_url)
            .bind(DownloadStatus::Downloading.to_code())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn requeue_stalled(&self) -> Result<u64, StorageError> {
        let requeued = sqlx::query("UPDATE download_metadata SET status = ? WHERE status = ?")
            .bind(DownloadStatus::Enqueued.to_code())
            .bind(DownloadStatus::Downloading.to_code())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?
            .rows_affected();
        if requeued > 0 {
            tracing::info!(requeued, "requeued stalled download items");
        }
        Ok(requeued)
    }
}

/// SQL predicate matching the filter's status groups. An empty filter
/// matches nothing.
fn status_predicate(filter: &DownloadItemFilter) -> String {
    if filter.statuses.is_empty() {
        return "0".to_owned();
    }
    filter
        .statuses
        .iter()
        .map(|group| match group {
            DownloadStatusGroup::Enqueued => {
                format!("status = {}", DownloadStatus::Enqueued.to_code())
            }
            DownloadStatusGroup::Downloading => {
                format!("status = {}", DownloadStatus::Downloading.to_code())
            }
            DownloadStatusGroup::Success => {
                format!("status = {}", DownloadStatus::Success.to_code())
            }
            DownloadStatusGroup::Skipped => {
                format!("status = {}", DownloadStatus::Skipped.to_code())
            }
            DownloadStatusGroup::Failed => format!(
                "(status = {} OR status >= 1000)",
                DownloadStatus::GenericError.to_code()
            ),
        })
        .map(|clause| format!("({clause})"))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn entry_from_row(row: &SqliteRow) -> Result<DownloadEntry, StorageError> {
    Ok(DownloadEntry {
        normalized_url: row.try_get("normalized_url").map_err(storage_err)?,
        download_url: row.try_get("download_url").map_err(storage_err)?,
        status: DownloadStatus::from_code(row.try_get("status").map_err(storage_err)?),
        content_type: row.try_get("type").map_err(storage_err)?,
        size: row
            .try_get::<Option<i64>, _>("size")
            .map_err(storage_err)?
            .map(from_i64),
    })
}

#[allow(clippy::cast_possible_wrap)]
fn to_i64(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
fn from_i64(value: i64) -> u64 {
    value.max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::test_pool;
    use dht_core::Snowflake;
    use futures_util::TryStreamExt;

    async fn seed_attachment(pool: &SqlitePool, id: i64, url: &str, size: i64, channel: i64) {
        sqlx::query(
            "INSERT INTO messages (message_id, sender_id, channel_id, text, timestamp) \
             VALUES (?, 1, ?, '', 0) \
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(id)
        .bind(channel)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO attachments \
             (message_id, attachment_id, name, type, normalized_url, download_url, size) \
             VALUES (?, ?, 'f.png', 'image/png', ?, ?, ?)",
        )
        .bind(id)
        .bind(id)
        .bind(url)
        .bind(format!("{url}?ex=1"))
        .bind(size)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn enqueue_inserts_only_unknown_urls() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 100, 5).await;
        seed_attachment(&pool, 2, "https://cdn.example.com/b.png", 100, 5).await;

        assert_eq!(
            repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap(),
            2
        );
        // Second pass finds nothing new
        assert_eq!(
            repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn enqueue_respects_size_filter() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/small.png", 100, 5).await;
        seed_attachment(&pool, 2, "https://cdn.example.com/big.png", 10_000, 5).await;

        let filter = AttachmentFilter {
            max_bytes: Some(1000),
            channel_ids: None,
        };
        assert_eq!(repo.enqueue_download_items(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_with_unmatched_filter_inserts_nothing() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 100, 5).await;

        let filter = AttachmentFilter {
            max_bytes: None,
            channel_ids: Some(vec![Snowflake(999)]),
        };
        assert_eq!(repo.enqueue_download_items(&filter).await.unwrap(), 0);
        assert_eq!(repo.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pull_transitions_to_downloading() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 100, 5).await;
        seed_attachment(&pool, 2, "https://cdn.example.com/b.png", 100, 5).await;
        repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap();

        let pulled = repo.pull_next_enqueued(10).await.unwrap();
        assert_eq!(pulled.len(), 2);
        assert!(pulled[0].download_url.ends_with("?ex=1"));

        // Everything is now Downloading; nothing left to pull
        assert!(repo.pull_next_enqueued(10).await.unwrap().is_empty());

        let entries: Vec<DownloadEntry> = repo.stream().try_collect().await.unwrap();
        assert!(entries.iter().all(|e| e.status == DownloadStatus::Downloading));
    }

    #[tokio::test]
    async fn success_outcome_stores_blob_and_actual_size() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 999, 5).await;
        repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap();
        repo.pull_next_enqueued(1).await.unwrap();

        repo.write_outcome(
            "https://cdn.example.com/a.png",
            &DownloadOutcome::Success {
                blob: vec![1, 2, 3, 4],
                content_type: Some("image/png".to_owned()),
            },
        )
        .await
        .unwrap();

        let (blob, content_type) = repo
            .get_successful_blob("https://cdn.example.com/a.png")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blob, vec![1, 2, 3, 4]);
        assert_eq!(content_type.as_deref(), Some("image/png"));

        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.successful.count, 1);
        assert_eq!(stats.successful.total_bytes, 4);
    }

    #[tokio::test]
    async fn write_outcome_for_unknown_url_is_not_found() {
        let repo = DownloadsRepository::new(test_pool().await).await.unwrap();
        let err = repo
            .write_outcome(
                "https://cdn.example.com/missing.png",
                &DownloadOutcome::Failed {
                    status: DownloadStatus::GenericError,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn retry_failed_flow_removes_and_requeues() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        for (id, url) in [
            (1, "https://cdn.example.com/ok.png"),
            (2, "https://cdn.example.com/bad.png"),
            (3, "https://cdn.example.com/worse.png"),
        ] {
            seed_attachment(&pool, id, url, 100, 5).await;
        }
        repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap();
        repo.pull_next_enqueued(3).await.unwrap();

        repo.write_outcome(
            "https://cdn.example.com/ok.png",
            &DownloadOutcome::Success {
                blob: vec![0; 8],
                content_type: None,
            },
        )
        .await
        .unwrap();
        repo.write_outcome(
            "https://cdn.example.com/bad.png",
            &DownloadOutcome::Failed { status: DownloadStatus::Http(404) },
        )
        .await
        .unwrap();
        repo.write_outcome(
            "https://cdn.example.com/worse.png",
            &DownloadOutcome::Failed { status: DownloadStatus::GenericError },
        )
        .await
        .unwrap();

        let stats = repo.get_statistics().await.unwrap();
        assert_eq!(stats.successful.count, 1);
        assert_eq!(stats.failed.count, 2);

        // Drop failed rows, keep everything else
        let keep = DownloadItemFilter::new([
            DownloadStatusGroup::Enqueued,
            DownloadStatusGroup::Downloading,
            DownloadStatusGroup::Success,
        ]);
        let removed = repo
            .remove_download_items(&keep, FilterRemovalMode::KeepMatching)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.get_statistics().await.unwrap().failed.count, 0);

        // Re-enqueue with the original filter finds the two again
        assert_eq!(
            repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn removing_metadata_cascades_to_blob() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 100, 5).await;
        repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap();
        repo.pull_next_enqueued(1).await.unwrap();
        repo.write_outcome(
            "https://cdn.example.com/a.png",
            &DownloadOutcome::Success {
                blob: vec![9],
                content_type: None,
            },
        )
        .await
        .unwrap();

        repo.remove_download_items(
            &DownloadItemFilter::new([DownloadStatusGroup::Success]),
            FilterRemovalMode::RemoveMatching,
        )
        .await
        .unwrap();

        let (blobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM download_blobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(blobs, 0);
    }

    #[tokio::test]
    async fn requeue_stalled_flips_downloading_back() {
        let pool = test_pool().await;
        let repo = DownloadsRepository::new(pool.clone()).await.unwrap();
        seed_attachment(&pool, 1, "https://cdn.example.com/a.png", 100, 5).await;
        repo.enqueue_download_items(&AttachmentFilter::all()).await.unwrap();
        repo.pull_next_enqueued(1).await.unwrap();

        assert_eq!(DownloadItemStore::requeue_stalled(&repo).await.unwrap(), 1);
        assert_eq!(repo.pull_next_enqueued(1).await.unwrap().len(), 1);
    }
}
