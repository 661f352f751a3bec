//! Resumable upload endpoints (/uploads/*)

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::Requester;
use crate::AppState;
use crate::domain::uploads::{ChunkProgress, SessionStatus, StartUpload};
use crate::models::{Asset, UploadTarget};
use crate::services::error::{IngestError, IngestResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/uploads", post(start_upload))
        .route("/uploads/{id}/chunks", post(upload_chunk))
        .route("/uploads/{id}/complete", post(complete_upload))
        .route("/uploads/{id}/status", get(upload_status))
        .route("/uploads/{id}", axum::routing::delete(cancel_upload))
}

#[derive(Deserialize)]
struct StartUploadRequest {
    file_name: String,
    file_size: u64,
    total_chunks: u32,
    file_type: String,
    /// Omit to upload into the shared library
    lesson_id: Option<i64>,
}

#[derive(Serialize)]
struct StartUploadResponse {
    upload_id: String,
}

/// POST /uploads - Negotiate a new upload session
async fn start_upload(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Json(req): Json<StartUploadRequest>,
) -> IngestResult<(StatusCode, Json<StartUploadResponse>)> {
    let target = match req.lesson_id {
        Some(lesson_id) => UploadTarget::Lesson { lesson_id },
        None => UploadTarget::Library,
    };

    let upload_id = state
        .uploads
        .start(
            user_id,
            StartUpload {
                file_name: req.file_name,
                file_size: req.file_size,
                total_chunks: req.total_chunks,
                mime_type: req.file_type,
                target,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(StartUploadResponse { upload_id })))
}

/// POST /uploads/:id/chunks - Store one chunk
/// Multipart fields: `chunk_index` (text) and `chunk` (bytes)
async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(upload_id): Path<String>,
    mut multipart: Multipart,
) -> IngestResult<Json<ChunkProgress>> {
    state.throttle.admit(user_id)?;

    let mut index: Option<u32> = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| IngestError::InvalidRequest(e.to_string()))?
    {
        match field.name() {
            Some("chunk_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| IngestError::InvalidRequest(e.to_string()))?;
                index = Some(text.trim().parse().map_err(|_| {
                    IngestError::InvalidRequest(format!("chunk_index is not a number: {}", text))
                })?);
            }
            Some("chunk") => {
                data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| IngestError::InvalidRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let index = index.ok_or_else(|| IngestError::InvalidRequest("chunk_index is required".into()))?;
    let data = data.ok_or_else(|| IngestError::InvalidRequest("chunk is required".into()))?;

    let progress = state
        .uploads
        .accept_chunk(user_id, &upload_id, index, data)
        .await?;
    Ok(Json(progress))
}

/// POST /uploads/:id/complete - Merge the chunks into an asset
async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(upload_id): Path<String>,
) -> IngestResult<(StatusCode, Json<Asset>)> {
    let asset = state.committer.complete(user_id, &upload_id).await?;
    Ok((StatusCode::CREATED, Json(asset)))
}

/// GET /uploads/:id/status
async fn upload_status(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(upload_id): Path<String>,
) -> IngestResult<Json<SessionStatus>> {
    Ok(Json(state.uploads.status(user_id, &upload_id).await?))
}

/// DELETE /uploads/:id - Cancel; unknown sessions are fine
async fn cancel_upload(
    State(state): State<Arc<AppState>>,
    Requester(user_id): Requester,
    Path(upload_id): Path<String>,
) -> IngestResult<StatusCode> {
    state.uploads.cancel(user_id, &upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
