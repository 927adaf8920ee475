//! Download item state machine and related value types.

use serde::Serialize;

/// State of one download item.
///
/// Persisted as a single integer column: sentinels below 1000, HTTP error
/// statuses encoded as `1000 + code` so a 404 and a 503 remain
/// distinguishable at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Enqueued,
    Downloading,
    Success,
    GenericError,
    Skipped,
    Http(u16),
}

/// Base offset for encoded HTTP statuses.
const HTTP_BASE: i64 = 1000;

impl DownloadStatus {
    /// Integer encoding stored in the database.
    pub const fn to_code(self) -> i64 {
        match self {
            Self::Enqueued => 0,
            Self::Downloading => 1,
            Self::Success => 2,
            Self::GenericError => 3,
            Self::Skipped => 4,
            Self::Http(code) => HTTP_BASE + code as i64,
        }
    }

    /// Decode a stored integer. Unknown sentinels map to `GenericError`
    /// rather than failing the whole query.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Enqueued,
            1 => Self::Downloading,
            2 => Self::Success,
            4 => Self::Skipped,
            c if c >= HTTP_BASE && c < HTTP_BASE + 600 => Self::Http((c - HTTP_BASE) as u16),
            _ => Self::GenericError,
        }
    }

    /// Whether this status counts as failed for statistics and retry.
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::GenericError | Self::Http(_))
    }
}

/// One enqueued download pulled by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    /// Canonical URL, primary key of the download tables.
    pub normalized_url: String,
    /// Verbatim URL the fetch actually hits.
    pub download_url: String,
}

/// Terminal result of one fetch attempt, written back to the store.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// Got the bytes; blob is stored alongside size and content type.
    Success {
        blob: Vec<u8>,
        content_type: Option<String>,
    },
    /// Size cap exceeded before or during the fetch; no blob stored.
    Skipped { size: Option<u64> },
    /// Fetch failed; the status records how.
    Failed { status: DownloadStatus },
}

impl DownloadOutcome {
    /// Status the store records for this outcome.
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::Success { .. } => DownloadStatus::Success,
            Self::Skipped { .. } => DownloadStatus::Skipped,
            Self::Failed { status } => *status,
        }
    }
}

/// One element of the engine's finished-items stream.
#[derive(Debug, Clone)]
pub struct FinishedDownload {
    pub normalized_url: String,
    pub status: DownloadStatus,
    pub size: Option<u64>,
}

/// Count and byte total for one statistics bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusBucket {
    pub count: u64,
    pub total_bytes: u64,
}

/// Snapshot of the download tables grouped by outcome.
///
/// `enqueued` includes items currently downloading; the distinction is
/// transient and not interesting to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStatusStatistics {
    pub enqueued: StatusBucket,
    pub successful: StatusBucket,
    pub failed: StatusBucket,
    pub skipped: StatusBucket,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            DownloadStatus::Enqueued,
            DownloadStatus::Downloading,
            DownloadStatus::Success,
            DownloadStatus::GenericError,
            DownloadStatus::Skipped,
            DownloadStatus::Http(404),
            DownloadStatus::Http(503),
        ] {
            assert_eq!(DownloadStatus::from_code(status.to_code()), status);
        }
    }

    #[test]
    fn http_statuses_encode_above_base() {
        assert_eq!(DownloadStatus::Http(404).to_code(), 1404);
        assert_eq!(DownloadStatus::from_code(1404), DownloadStatus::Http(404));
    }

    #[test]
    fn unknown_codes_decode_as_generic_error() {
        assert_eq!(DownloadStatus::from_code(99), DownloadStatus::GenericError);
        assert_eq!(DownloadStatus::from_code(-7), DownloadStatus::GenericError);
        // Outside any plausible HTTP range
        assert_eq!(DownloadStatus::from_code(5000), DownloadStatus::GenericError);
    }

    #[test]
    fn failed_covers_generic_and_http() {
        assert!(DownloadStatus::GenericError.is_failed());
        assert!(DownloadStatus::Http(500).is_failed());
        assert!(!DownloadStatus::Success.is_failed());
        assert!(!DownloadStatus::Skipped.is_failed());
    }

    #[test]
    fn outcome_reports_matching_status() {
        let success = DownloadOutcome::Success {
            blob: vec![1, 2, 3],
            content_type: Some("image/png".into()),
        };
        assert_eq!(success.status(), DownloadStatus::Success);

        let failed = DownloadOutcome::Failed {
            status: DownloadStatus::Http(403),
        };
        assert_eq!(failed.status(), DownloadStatus::Http(403));
    }
}
