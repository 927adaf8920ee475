//! Shared application state type.

use std::sync::Arc;

use dht_db::Database;

/// Context shared across all handlers.
pub struct ServerContext {
    pub db: Arc<Database>,
    /// Per-session token every request must present.
    pub token: String,
    /// Request body cap in bytes.
    pub max_body_bytes: usize,
}

/// Application state shared across all handlers.
pub type AppState = Arc<ServerContext>;
