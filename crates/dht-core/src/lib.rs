//! Core domain types and port definitions for the history tracker companion.
//!
//! This crate holds everything the storage, server and downloader crates
//! share: the archived entity types, the download status machine, URL
//! normalization, error types and the reactive plumbing (count observables
//! and the latest-wins throttled task).
//!
//! # Design Rules
//!
//! - No `sqlx`, `axum` or `reqwest` types in any signature
//! - Traits are minimal and intent-based
//! - Snowflakes cross the wire as decimal strings and live here as `u64`

pub mod download;
pub mod entities;
pub mod error;
pub mod filters;
pub mod observe;
pub mod ports;
pub mod url_norm;

// Re-export commonly used types for convenience
pub use download::{
    DownloadItem, DownloadOutcome, DownloadStatus, DownloadStatusStatistics, FinishedDownload,
    StatusBucket,
};
pub use entities::{
    Attachment, Channel, Embed, Message, Poll, PollAnswer, Reaction, ReactionEmoji, Server,
    ServerType, Snowflake, User,
};
pub use error::{DownloadError, SchemaError, StorageError};
pub use filters::{AttachmentFilter, DownloadItemFilter, DownloadStatusGroup, FilterRemovalMode};
pub use observe::{CountObservable, CountPublisher, ThrottledTask};
pub use ports::DownloadItemStore;
pub use url_norm::normalize_download_url;
