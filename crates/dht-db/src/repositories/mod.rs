//! One repository per entity family.
//!
//! Every repository follows the same contract: batched upserts in a single
//! transaction, an async count, a lazy row stream that borrows a pooled
//! connection until dropped, and a `total_count` observable that emits the
//! current row count on subscription and after every mutation.

mod channels;
mod downloads;
mod messages;
mod servers;
mod users;

pub use channels::ChannelsRepository;
pub use downloads::{DownloadEntry, DownloadsRepository};
pub use messages::MessagesRepository;
pub use servers::ServersRepository;
pub use users::UsersRepository;

use dht_core::StorageError;

pub(crate) fn storage_err(e: sqlx::Error) -> StorageError {
    StorageError::Storage(e.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use sqlx::SqlitePool;

    use crate::schema::{setup_schema, AlwaysUpgrade};
    use crate::setup::create_memory_pool;

    /// In-memory pool with the full current schema applied.
    pub(crate) async fn test_pool() -> SqlitePool {
        let pool = create_memory_pool().await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        setup_schema(&mut conn, &AlwaysUpgrade).await.unwrap();
        pool
    }
}
