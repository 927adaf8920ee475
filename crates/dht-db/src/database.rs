//! Database facade: one handle aggregating the pool and every repository.

use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::watch;

use dht_core::SchemaError;

use crate::repositories::{
    ChannelsRepository, DownloadsRepository, MessagesRepository, ServersRepository,
    UsersRepository,
};
use crate::schema::{setup_schema, SchemaSetupOutcome, SchemaUpgradeCallbacks};
use crate::setup::{create_memory_pool, create_pool};

/// Result of [`Database::open`].
pub enum DatabaseOpenResult {
    /// Schema is current; the archive is ready for use.
    Opened(Database),
    /// The caller's `can_upgrade` refused; the file was left untouched.
    UpgradeRefused,
}

/// Single handle over the archive.
///
/// Construction is a two-phase open: create the pool, then run the schema
/// manager on a dedicated connection. Dropping in-flight work is never
/// necessary; `close` drains the pool before resolving.
pub struct Database {
    pool: SqlitePool,
    users: Arc<UsersRepository>,
    servers: Arc<ServersRepository>,
    channels: Arc<ChannelsRepository>,
    messages: Arc<MessagesRepository>,
    downloads: Arc<DownloadsRepository>,
    closed_tx: watch::Sender<bool>,
}

impl Database {
    /// Open (creating if missing) the archive at `path`.
    pub async fn open(
        path: &Path,
        callbacks: &dyn SchemaUpgradeCallbacks,
    ) -> Result<DatabaseOpenResult, SchemaError> {
        let pool = create_pool(path).await?;
        Self::finish_open(pool, callbacks).await
    }

    /// In-memory archive for tests; the schema is always created fresh.
    pub async fn open_in_memory() -> Result<Self, SchemaError> {
        let pool = create_memory_pool().await?;
        match Self::finish_open(pool, &crate::schema::AlwaysUpgrade).await? {
            DatabaseOpenResult::Opened(db) => Ok(db),
            DatabaseOpenResult::UpgradeRefused => unreachable!("fresh schema never upgrades"),
        }
    }

    async fn finish_open(
        pool: SqlitePool,
        callbacks: &dyn SchemaUpgradeCallbacks,
    ) -> Result<DatabaseOpenResult, SchemaError> {
        // Schema work runs on its own connection, acquired before any
        // repository can compete for the pool.
        {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| SchemaError::Storage(dht_core::StorageError::Storage(e.to_string())))?;
            match setup_schema(&mut conn, callbacks).await? {
                SchemaSetupOutcome::Ready => {}
                SchemaSetupOutcome::UpgradeRefused => {
                    pool.close().await;
                    return Ok(DatabaseOpenResult::UpgradeRefused);
                }
            }
        }

        let users = Arc::new(UsersRepository::new(pool.clone()).await?);
        let servers = Arc::new(ServersRepository::new(pool.clone()).await?);
        let channels = Arc::new(ChannelsRepository::new(pool.clone()).await?);
        let messages = Arc::new(MessagesRepository::new(pool.clone()).await?);
        let downloads = Arc::new(DownloadsRepository::new(pool.clone()).await?);

        let (closed_tx, _) = watch::channel(false);

        Ok(DatabaseOpenResult::Opened(Self {
            pool,
            users,
            servers,
            channels,
            messages,
            downloads,
            closed_tx,
        }))
    }

    pub fn users(&self) -> &Arc<UsersRepository> {
        &self.users
    }

    pub fn servers(&self) -> &Arc<ServersRepository> {
        &self.servers
    }

    pub fn channels(&self) -> &Arc<ChannelsRepository> {
        &self.channels
    }

    pub fn messages(&self) -> &Arc<MessagesRepository> {
        &self.messages
    }

    pub fn downloads(&self) -> &Arc<DownloadsRepository> {
        &self.downloads
    }

    /// The raw pool, for callers that need ad-hoc queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fires `true` once teardown completes.
    pub fn on_closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Drain in-flight operations, close the file, then signal `closed`.
    pub async fn close(&self) {
        self.pool.close().await;
        self.closed_tx.send_replace(true);
        tracing::info!("database closed");
    }
}
