//! Single-item fetch and outcome classification.

use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use dht_core::{DownloadError, DownloadItem, DownloadOutcome, DownloadStatus};

/// Fetch one item and classify the result.
///
/// Every failure becomes a terminal [`DownloadOutcome`]; this function
/// never aborts the engine. Cancellation is handled by the caller racing
/// this future against the stop token.
pub(crate) async fn fetch_item(
    client: &Client,
    item: &DownloadItem,
    size_cap_bytes: Option<u64>,
) -> DownloadOutcome {
    match try_fetch(client, item, size_cap_bytes).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(url = %item.normalized_url, %error, "download attempt failed");
            DownloadOutcome::Failed {
                status: classify(&error),
            }
        }
    }
}

async fn try_fetch(
    client: &Client,
    item: &DownloadItem,
    size_cap_bytes: Option<u64>,
) -> Result<DownloadOutcome, DownloadError> {
    let response = client
        .get(&item.download_url)
        .send()
        .await
        .map_err(map_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        return Ok(DownloadOutcome::Failed {
            status: DownloadStatus::Http(status.as_u16()),
        });
    }

    // Cheap pre-check before any body bytes arrive
    if let (Some(cap), Some(declared)) = (size_cap_bytes, response.content_length()) {
        if declared > cap {
            return Ok(DownloadOutcome::Skipped {
                size: Some(declared),
            });
        }
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut blob: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest)?;
        blob.extend_from_slice(&chunk);
        if let Some(cap) = size_cap_bytes {
            if blob.len() as u64 > cap {
                return Ok(DownloadOutcome::Skipped {
                    size: Some(blob.len() as u64),
                });
            }
        }
    }

    Ok(DownloadOutcome::Success { blob, content_type })
}

fn map_reqwest(error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::Timeout
    } else {
        DownloadError::Transport(error.to_string())
    }
}

/// Transport errors and timeouts share one recorded status; the HTTP case
/// is produced directly in `try_fetch` with its code attached.
fn classify(error: &DownloadError) -> DownloadStatus {
    match error {
        DownloadError::HttpStatus(code) => DownloadStatus::Http(*code),
        _ => DownloadStatus::GenericError,
    }
}
