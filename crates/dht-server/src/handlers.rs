//! Ingest endpoint handlers.
//!
//! Bodies arrive as raw bytes; JSON parsing and validation are explicit so
//! the status-code contract holds: non-JSON is 415, a failing field is 400
//! with its path, storage trouble is a bare 500.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use dht_core::Snowflake;

use crate::error::ApiError;
use crate::payload;
use crate::state::AppState;

fn ensure_json(headers: &HeaderMap) -> Result<(), ApiError> {
    // Bodies are application/json, declared as such; a request that
    // declares nothing fails the same way as one declaring text/plain.
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .ok_or(ApiError::UnsupportedPayload)?
        .to_str()
        .map_err(|_| ApiError::UnsupportedPayload)?;
    if content_type.trim_start().starts_with("application/json") {
        Ok(())
    } else {
        Err(ApiError::UnsupportedPayload)
    }
}

fn parse_json(headers: &HeaderMap, body: &Bytes) -> Result<Value, ApiError> {
    ensure_json(headers)?;
    serde_json::from_slice(body).map_err(|_| ApiError::UnsupportedPayload)
}

/// `POST /track-channel` — upsert the server and the channel.
pub async fn track_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let value = parse_json(&headers, &body)?;
    let (server, channel) = payload::parse_track_channel(&value)?;

    state.db.servers().add(std::slice::from_ref(&server)).await?;
    state.db.channels().add(std::slice::from_ref(&channel)).await?;

    tracing::debug!(server = %server.id, channel = %channel.id, "tracked channel");
    Ok(StatusCode::OK)
}

/// `POST /track-users` — upsert a batch of users.
pub async fn track_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let value = parse_json(&headers, &body)?;
    let users = payload::parse_track_users(&value)?;

    state.db.users().add(&users).await?;

    tracing::debug!(count = users.len(), "tracked users");
    Ok(StatusCode::OK)
}

/// `POST /track-messages` — upsert messages with their derived rows.
///
/// Answers `"1"` when at least one submitted id was not yet archived,
/// `"0"` otherwise; the capture script uses this to decide whether to keep
/// scrolling back.
pub async fn track_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, ApiError> {
    let value = parse_json(&headers, &body)?;
    let messages = payload::parse_track_messages(&value)?;

    let mut distinct: Vec<Snowflake> = messages.iter().map(|m| m.id).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let stored_before = state.db.messages().count_existing(&distinct).await?;
    state.db.messages().add(&messages).await?;

    let any_new = stored_before < distinct.len() as i64;
    tracing::debug!(
        submitted = distinct.len(),
        stored_before,
        any_new,
        "tracked messages"
    );
    Ok(if any_new { "1" } else { "0" }.to_owned())
}

/// `GET /get-attachment?url=<normalized>` — serve an archived blob.
pub async fn get_attachment(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let url = params
        .get("url")
        .ok_or_else(|| ApiError::Validation("url".to_owned(), "missing required field".to_owned()))?;

    match state.db.downloads().get_successful_blob(url).await? {
        Some((blob, content_type)) => {
            let content_type =
                content_type.unwrap_or_else(|| "application/octet-stream".to_owned());
            Ok(([(header::CONTENT_TYPE, content_type)], blob).into_response())
        }
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}
