//! Filters used when enqueuing and pruning download items.

use crate::download::DownloadStatus;
use crate::entities::Snowflake;

/// Selects attachments eligible for enqueuing.
///
/// `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentFilter {
    /// Only attachments at most this many bytes.
    pub max_bytes: Option<u64>,
    /// Only attachments on messages in these channels.
    pub channel_ids: Option<Vec<Snowflake>>,
}

impl AttachmentFilter {
    /// Filter matching every attachment.
    pub const fn all() -> Self {
        Self {
            max_bytes: None,
            channel_ids: None,
        }
    }
}

/// Coarse status groups used by removal filters and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatusGroup {
    Enqueued,
    Downloading,
    Success,
    Failed,
    Skipped,
}

impl DownloadStatusGroup {
    /// Whether a concrete status belongs to this group.
    pub const fn contains(self, status: DownloadStatus) -> bool {
        match self {
            Self::Enqueued => matches!(status, DownloadStatus::Enqueued),
            Self::Downloading => matches!(status, DownloadStatus::Downloading),
            Self::Success => matches!(status, DownloadStatus::Success),
            Self::Failed => status.is_failed(),
            Self::Skipped => matches!(status, DownloadStatus::Skipped),
        }
    }
}

/// Selects download items by status group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItemFilter {
    pub statuses: Vec<DownloadStatusGroup>,
}

impl DownloadItemFilter {
    pub fn new(statuses: impl Into<Vec<DownloadStatusGroup>>) -> Self {
        Self {
            statuses: statuses.into(),
        }
    }

    /// Whether a concrete status matches any of the groups.
    pub fn matches(&self, status: DownloadStatus) -> bool {
        self.statuses.iter().any(|g| g.contains(status))
    }
}

/// How a removal filter is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterRemovalMode {
    /// Delete the items the filter matches.
    RemoveMatching,
    /// Delete everything the filter does not match.
    KeepMatching,
}
