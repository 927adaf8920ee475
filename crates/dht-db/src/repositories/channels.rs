//! Repository for tracked channels.

use futures_util::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dht_core::{Channel, CountObservable, CountPublisher, Snowflake, StorageError};

use super::storage_err;
use crate::upsert::TableColumns;

const CHANNELS: TableColumns = TableColumns {
    table: "channels",
    key_columns: &["id"],
    data_columns: &["server", "name", "parent_id", "position", "topic", "nsfw"],
};

pub struct ChannelsRepository {
    pool: SqlitePool,
    total_count: CountPublisher,
}

impl ChannelsRepository {
    pub(crate) async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let repo = Self {
            pool,
            total_count: CountPublisher::default(),
        };
        repo.update_total_count().await?;
        Ok(repo)
    }

    pub async fn add(&self, channels: &[Channel]) -> Result<(), StorageError> {
        let sql = CHANNELS.upsert_sql();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for channel in channels {
            sqlx::query(&sql)
                .bind(channel.id.to_db())
                .bind(channel.server_id.to_db())
                .bind(&channel.name)
                .bind(channel.parent_id.map(Snowflake::to_db))
                .bind(channel.position)
                .bind(&channel.topic)
                .bind(channel.nsfw)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        self.update_total_count().await
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM channels")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    pub fn stream(&self) -> impl Stream<Item = Result<Channel, StorageError>> + Send + '_ {
        sqlx::query(
            "SELECT id, server, name, parent_id, position, topic, nsfw FROM channels ORDER BY id",
        )
        .fetch(&self.pool)
        .map(|result| result.map_err(storage_err).and_then(|row| channel_from_row(&row)))
    }

    pub fn total_count(&self) -> CountObservable {
        self.total_count.subscribe()
    }

    async fn update_total_count(&self) -> Result<(), StorageError> {
        self.total_count.set(self.count().await?);
        Ok(())
    }
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel, StorageError> {
    Ok(Channel {
        id: Snowflake::from_db(row.try_get("id").map_err(storage_err)?),
        server_id: Snowflake::from_db(row.try_get("server").map_err(storage_err)?),
        name: row.try_get("name").map_err(storage_err)?,
        parent_id: row
            .try_get::<Option<i64>, _>("parent_id")
            .map_err(storage_err)?
            .map(Snowflake::from_db),
        position: row.try_get("position").map_err(storage_err)?,
        topic: row.try_get("topic").map_err(storage_err)?,
        nsfw: row.try_get("nsfw").map_err(storage_err)?,
    })
}
