//! Repository for tracked users.

use futures_util::{Stream, StreamExt};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use dht_core::{CountObservable, CountPublisher, Snowflake, StorageError, User};

use super::storage_err;
use crate::upsert::TableColumns;

const USERS: TableColumns = TableColumns {
    table: "users",
    key_columns: &["id"],
    data_columns: &["name", "avatar_url", "discriminator"],
};

pub struct UsersRepository {
    pool: SqlitePool,
    total_count: CountPublisher,
}

impl UsersRepository {
    pub(crate) async fn new(pool: SqlitePool) -> Result<Self, StorageError> {
        let repo = Self {
            pool,
            total_count: CountPublisher::default(),
        };
        repo.update_total_count().await?;
        Ok(repo)
    }

    /// Upsert a batch in one transaction; last write wins per id.
    pub async fn add(&self, users: &[User]) -> Result<(), StorageError> {
        let sql = USERS.upsert_sql();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for user in users {
            sqlx::query(&sql)
                .bind(user.id.to_db())
                .bind(&user.name)
                .bind(&user.avatar_url)
                .bind(&user.discriminator)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        self.update_total_count().await
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    /// Lazy row stream; holds a pooled connection until exhausted or dropped.
    pub fn stream(&self) -> impl Stream<Item = Result<User, StorageError>> + Send + '_ {
        sqlx::query("SELECT id, name, avatar_url, discriminator FROM users ORDER BY id")
            .fetch(&self.pool)
            .map(|result| result.map_err(storage_err).and_then(|row| user_from_row(&row)))
    }

    pub fn total_count(&self) -> CountObservable {
        self.total_count.subscribe()
    }

    async fn update_total_count(&self) -> Result<(), StorageError> {
        self.total_count.set(self.count().await?);
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> Result<User, StorageError> {
    Ok(User {
        id: Snowflake::from_db(row.try_get("id").map_err(storage_err)?),
        name: row.try_get("name").map_err(storage_err)?,
        avatar_url: row.try_get("avatar_url").map_err(storage_err)?,
        discriminator: row.try_get("discriminator").map_err(storage_err)?,
    })
}
