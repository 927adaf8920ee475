//! SQLite storage for the history tracker companion.
//!
//! Owns the connection pool, the versioned schema with forward-only
//! migrations, one repository per entity family and the [`Database`]
//! facade that wires them together. All rows live in a single SQLite
//! file owned exclusively by this process.

pub mod database;
pub mod repositories;
pub mod schema;
pub mod setup;
mod upsert;

pub use database::{Database, DatabaseOpenResult};
pub use repositories::{
    ChannelsRepository, DownloadsRepository, MessagesRepository, ServersRepository,
    UsersRepository,
};
pub use schema::{AlwaysUpgrade, SchemaUpgradeCallbacks, CURRENT_VERSION};
pub use setup::{create_pool, pool_capacity};
