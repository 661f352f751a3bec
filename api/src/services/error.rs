//! Error handling for the ingest subsystem and route handlers

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::domain::quota::QuotaExceeded;
use crate::services::kv::StoreError;
use crate::services::probe::ProbeError;
use crate::services::transcriber::TranscriberError;
use crate::storage::BlobError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload session not found or expired")]
    SessionNotFound,

    #[error("chunk index {index} is outside 0..{total}")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("upload incomplete: {received} of {total} chunks received")]
    IncompleteUpload { received: u32, total: u32 },

    #[error("chunk {0} is missing from storage")]
    MissingChunk(u32),

    #[error("{0}")]
    QuotaExceeded(QuotaExceeded),

    #[error("lesson {0} holds another user's asset")]
    LessonOwnedByOther(i64),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("job {0} was already claimed")]
    JobClaimConflict(String),

    #[error("enrichment failed: {0}")]
    EnrichmentFailure(String),

    #[error("asset not found")]
    AssetNotFound,

    #[error("no transcription job found")]
    JobNotFound,

    #[error("too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("merged size {actual} does not match stored chunk total {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("media probe error: {0}")]
    Probe(#[from] ProbeError),
}

impl From<QuotaExceeded> for IngestError {
    fn from(e: QuotaExceeded) -> Self {
        IngestError::QuotaExceeded(e)
    }
}

/// Messages from the transcription service are kept verbatim
impl From<TranscriberError> for IngestError {
    fn from(e: TranscriberError) -> Self {
        IngestError::EnrichmentFailure(e.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::SessionNotFound
            | IngestError::AssetNotFound
            | IngestError::JobNotFound => StatusCode::NOT_FOUND,
            IngestError::InvalidChunkIndex { .. }
            | IngestError::IncompleteUpload { .. }
            | IngestError::UnsupportedMediaType(_)
            | IngestError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            IngestError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            IngestError::JobClaimConflict(_) | IngestError::LessonOwnedByOther(_) => {
                StatusCode::CONFLICT
            }
            IngestError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            IngestError::EnrichmentFailure(_) => StatusCode::BAD_GATEWAY,
            IngestError::MissingChunk(_)
            | IngestError::SizeMismatch { .. }
            | IngestError::Store(_)
            | IngestError::Storage(_)
            | IngestError::Database(_)
            | IngestError::Probe(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            IngestError::SessionNotFound => "session_not_found",
            IngestError::InvalidChunkIndex { .. } => "invalid_chunk_index",
            IngestError::IncompleteUpload { .. } => "incomplete_upload",
            IngestError::MissingChunk(_) => "missing_chunk",
            IngestError::QuotaExceeded(_) => "quota_exceeded",
            IngestError::LessonOwnedByOther(_) => "lesson_owned_by_other",
            IngestError::UnsupportedMediaType(_) => "unsupported_media_type",
            IngestError::InvalidRequest(_) => "invalid_request",
            IngestError::JobClaimConflict(_) => "job_claim_conflict",
            IngestError::EnrichmentFailure(_) => "enrichment_failure",
            IngestError::AssetNotFound => "asset_not_found",
            IngestError::JobNotFound => "job_not_found",
            IngestError::RateLimited { .. } => "rate_limited",
            IngestError::SizeMismatch { .. } => "size_mismatch",
            IngestError::Store(_)
            | IngestError::Storage(_)
            | IngestError::Database(_)
            | IngestError::Probe(_) => "internal_error",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let IngestError::QuotaExceeded(q) = &self {
            body["used_mb"] = json!(q.used_mb);
            body["incoming_mb"] = json!(q.incoming_mb);
            body["limit_mb"] = json!(q.limit_mb);
        }

        if let IngestError::RateLimited { retry_after_secs } = &self {
            return (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response();
        }
        (status, Json(body)).into_response()
    }
}

/// Extension trait for logging errors and converting to StatusCode
pub trait LogErr<T> {
    /// Log error with context and return INTERNAL_SERVER_ERROR
    fn log_500(self, context: &str) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            tracing::error!(error = %e, "{}", context);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }
}
