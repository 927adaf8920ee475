//! HTTP error mapping for the ingest API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use dht_core::StorageError;

/// Errors a handler can surface.
///
/// Bad tokens and malformed payloads answer with empty bodies; validation
/// failures carry the dotted path of the offending field so the capture
/// script's logs point somewhere useful. Storage failures are logged with
/// an error id and answered 500 with no detail.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("token mismatch")]
    Forbidden,

    /// Body is not JSON (or not the declared content type).
    #[error("unsupported payload")]
    UnsupportedPayload,

    /// Well-formed JSON failing validation; `0` is the field path.
    #[error("invalid field {0}: {1}")]
    Validation(String, String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Forbidden => StatusCode::FORBIDDEN.into_response(),
            Self::UnsupportedPayload => StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response(),
            Self::Validation(path, reason) => {
                tracing::warn!(%path, %reason, "rejected payload");
                (StatusCode::BAD_REQUEST, format!("{path}: {reason}")).into_response()
            }
            Self::Storage(error) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, %error, "storage failure during request");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
