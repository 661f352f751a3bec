//! Asset and transcription endpoints (/assets/*)

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::auth::Requester;
use crate::AppState;
use crate::models::{Asset, JobStatus, JobStatusView};
use crate::services::error::{IngestError, IngestResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/assets/{id}", get(get_asset).delete(delete_asset))
        .route("/assets/{id}/media", get(serve_asset_media))
        .route("/assets/{id}/duration", patch(update_duration))
        .route("/assets/{id}/transcriptions", post(request_transcription))
        .route(
            "/assets/{id}/transcriptions/status",
            get(transcription_status),
        )
}

/// Asset owned by `user_id`. Other users' assets look absent.
async fn owned_asset(state: &AppState, user_id: i64, asset_id: i64) -> IngestResult<Asset> {
    state
        .assets
        .get(asset_id)
        .await?
        .filter(|a| a.owner_id == user_id)
        .ok_or(IngestError::AssetNotFound)
}

/// GET /assets/:id
async fn get_asset(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
) -> IngestResult<Json<Asset>> {
    Ok(Json(owned_asset(&state, user_id, asset_id).await?))
}

/// DELETE /assets/:id - Remove the record and its stored objects
async fn delete_asset(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
) -> IngestResult<StatusCode> {
    owned_asset(&state, user_id, asset_id).await?;

    let Some(asset) = state.assets.delete(asset_id).await? else {
        return Ok(StatusCode::NO_CONTENT);
    };

    let keys = std::iter::once(asset.storage_key.as_str()).chain(asset.audio_key.as_deref());
    for key in keys {
        if let Err(e) = state.blobs.delete(key).await {
            warn!(asset_id, key, error = %e, "failed to delete asset object");
        }
    }

    info!(asset_id, user_id, "asset deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DurationRequest {
    duration_secs: f64,
}

/// PATCH /assets/:id/duration - Backfill a duration the probe could not read
async fn update_duration(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
    Json(req): Json<DurationRequest>,
) -> IngestResult<Json<Asset>> {
    if !req.duration_secs.is_finite() || req.duration_secs <= 0.0 {
        return Err(IngestError::InvalidRequest(
            "duration_secs must be a positive number".into(),
        ));
    }
    owned_asset(&state, user_id, asset_id).await?;

    let asset = state
        .assets
        .set_duration(asset_id, req.duration_secs)
        .await?
        .ok_or(IngestError::AssetNotFound)?;
    Ok(Json(asset))
}

/// Byte range requested by a `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeRequest {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Only single `bytes=` ranges are honored. Anything malformed or multi-range
/// falls back to the whole object.
fn parse_range(value: Option<&str>, len: u64) -> RangeRequest {
    let Some(ranges) = value.and_then(|v| v.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // suffix: last N bytes
        return match last.parse::<u64>() {
            Ok(0) => RangeRequest::Unsatisfiable,
            Ok(_) if len == 0 => RangeRequest::Unsatisfiable,
            Ok(n) => RangeRequest::Partial {
                start: len.saturating_sub(n),
                end: len - 1,
            },
            Err(_) => RangeRequest::Full,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        None
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return RangeRequest::Full,
        }
    };

    if start >= len {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial {
        start,
        end: end.map_or(len - 1, |e| e.min(len - 1)),
    }
}

/// GET /assets/:id/media - Stream the stored object, honoring Range
async fn serve_asset_media(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
    headers: HeaderMap,
) -> IngestResult<Response> {
    let asset = owned_asset(&state, user_id, asset_id).await?;
    let len = state.blobs.size(&asset.storage_key).await?;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let response = match parse_range(range, len) {
        RangeRequest::Full => {
            let body = Body::from_stream(state.blobs.open(&asset.storage_key, None).await?);
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, asset.mime_type),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_LENGTH, len.to_string()),
                ],
                body,
            )
                .into_response()
        }
        RangeRequest::Partial { start, end } => {
            let stream = state
                .blobs
                .open(&asset.storage_key, Some((start, end)))
                .await?;
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, asset.mime_type),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (header::CONTENT_LENGTH, (end - start + 1).to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, end, len),
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        RangeRequest::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", len))],
        )
            .into_response(),
    };

    Ok(response)
}

#[derive(Serialize)]
struct TranscriptionAccepted {
    job_id: String,
    status: JobStatus,
    progress: u8,
}

/// POST /assets/:id/transcriptions - Start (or rejoin) a transcription
/// Responds immediately; the job runs in the background.
async fn request_transcription(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
) -> IngestResult<(StatusCode, Json<TranscriptionAccepted>)> {
    owned_asset(&state, user_id, asset_id).await?;

    let (job, created) = state.jobs.create(asset_id, user_id).await?;
    if created {
        state.dispatcher.dispatch(job.id.clone());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(TranscriptionAccepted {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
        }),
    ))
}

/// GET /assets/:id/transcriptions/status - Latest job for the asset
async fn transcription_status(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(asset_id): Path<i64>,
) -> IngestResult<Json<JobStatusView>> {
    owned_asset(&state, user_id, asset_id).await?;

    let job = state
        .jobs
        .latest_for_asset(asset_id)
        .await?
        .ok_or(IngestError::JobNotFound)?;
    Ok(Json(JobStatusView::from(&job)))
}
