//! Loopback ingest API.
//!
//! The browser-side capture script pushes tracked entities here. Every
//! request carries the per-session token; bodies are raw JSON validated
//! field by field so rejections can name the offending path.

mod error;
mod handlers;
mod payload;
mod routes;
mod state;

pub use routes::{build_router, start_server, ServerConfig, ServerInfo, DEFAULT_MAX_BODY_BYTES};
pub use state::{AppState, ServerContext};
