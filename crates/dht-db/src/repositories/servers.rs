//! Repository for tracked servers (guilds, group chats, DM pseudo-servers).

use futures_util::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dht_core::{CountObservable, CountPublisher, Server, ServerType, Snowflake, StorageError};

use super::storage_err;
use crate::upsert::TableColumns;

const SERVERS: TableColumns = TableColumns {
    table: "servers",
    key_columns: &["id"],
    data_columns: &["name", "type"],
};

pub struct ServersRepository {
    pool: SqlitePool,
    total_count: CountPublisher,
}

impl ServersRepository {
    pub(crate) async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let repo = Self {
            pool,
            total_count: CountPublisher::default(),
        };
        repo.update_total_count().await?;
        Ok(repo)
    }

    pub async fn add(&self, servers: &[Server]) -> Result<(), StorageError> {
        let sql = SERVERS.upsert_sql();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for server in servers {
            sqlx::query(&sql)
                .bind(server.id.to_db())
                .bind(&server.name)
                .bind(server.server_type.as_str())
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        self.update_total_count().await
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM servers")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    pub fn stream(&self) -> impl Stream<Item = Result<Server, StorageError>> + Send + '_ {
        sqlx::query("SELECT id, name, type FROM servers ORDER BY id")
            .fetch(&self.pool)
            .map(|result| result.map_err(storage_err).and_then(|row| server_from_row(&row)))
    }

    pub fn total_count(&self) -> CountObservable {
        self.total_count.subscribe()
    }

    async fn update_total_count(&self) -> Result<(), StorageError> {
        self.total_count.set(self.count().await?);
        Ok(())
    }
}

fn server_from_row(row: &SqliteRow) -> Result<Server, StorageError> {
    let tag: String = row.try_get("type").map_err(storage_err)?;
    let server_type = ServerType::parse(&tag)
        .ok_or_else(|| StorageError::Storage(format!("unknown server type tag: {tag}")))?;
    Ok(Server {
        id: Snowflake::from_db(row.try_get("id").map_err(storage_err)?),
        name: row.try_get("name").map_err(storage_err)?,
        server_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::test_pool;
    use futures_util::TryStreamExt;

    #[tokio::test]
    async fn upsert_is_idempotent_per_id() {
        let repo = ServersRepository::new(test_pool().await).await.unwrap();
        let server = Server {
            id: Snowflake(1),
            name: "S".to_owned(),
            server_type: ServerType::Server,
        };

        repo.add(&[server.clone()]).await.unwrap();
        repo.add(&[server]).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn type_tag_round_trips() {
        let repo = ServersRepository::new(test_pool().await).await.unwrap();
        repo.add(&[Server {
            id: Snowflake(9),
            name: "group".to_owned(),
            server_type: ServerType::DirectMessage,
        }])
        .await
        .unwrap();

        let servers: Vec<Server> = repo.stream().try_collect().await.unwrap();
        assert_eq!(servers[0].server_type, ServerType::DirectMessage);
    }
}
