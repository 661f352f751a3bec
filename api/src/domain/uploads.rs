//! Resumable upload sessions
//!
//! A session records the declared shape of an upload and which chunk indices
//! have arrived. Chunks are stored independently under `uploads/{token}/{index}`
//! and may arrive in any order, any number of times.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{ALLOWED_MIME_TYPES, SESSION_KEY_PREFIX};
use crate::domain::assets::AssetRepository;
use crate::models::{UploadSession, UploadTarget};
use crate::services::error::{IngestError, IngestResult};
use crate::services::kv::{self, KvStore};
use crate::services::plans::{self, PlanLookup};
use crate::storage::BlobStore;

pub fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, token)
}

pub fn chunk_key(token: &str, index: u32) -> String {
    format!("uploads/{}/{}", token, index)
}

fn committing_error() -> IngestError {
    IngestError::InvalidRequest("upload is being committed".into())
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartUpload {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub mime_type: String,
    pub target: UploadTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_size: u64,
}

pub struct UploadSessionManager {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) plans: Arc<dyn PlanLookup>,
    pub(crate) assets: Arc<dyn AssetRepository>,
    session_ttl: Duration,
}

impl UploadSessionManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        plans: Arc<dyn PlanLookup>,
        assets: Arc<dyn AssetRepository>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            plans,
            assets,
            session_ttl,
        }
    }

    /// Validates the declared upload, pre-checks quota and mints a session token
    pub async fn start(&self, user_id: i64, req: StartUpload) -> IngestResult<String> {
        if req.file_name.trim().is_empty() {
            return Err(IngestError::InvalidRequest("file_name is required".into()));
        }
        if req.file_size == 0 {
            return Err(IngestError::InvalidRequest(
                "file_size must be greater than zero".into(),
            ));
        }
        if req.total_chunks == 0 {
            return Err(IngestError::InvalidRequest(
                "total_chunks must be at least 1".into(),
            ));
        }
        if u64::from(req.total_chunks) > req.file_size {
            return Err(IngestError::InvalidRequest(
                "total_chunks cannot exceed file_size".into(),
            ));
        }
        if !ALLOWED_MIME_TYPES.contains(&req.mime_type.as_str()) {
            return Err(IngestError::UnsupportedMediaType(req.mime_type));
        }

        let released = self.released_bytes(user_id, &req.target).await?;
        plans::admit(self.plans.as_ref(), user_id, released, req.file_size).await?;

        let token = Uuid::new_v4().to_string();
        let session = UploadSession {
            token: token.clone(),
            user_id,
            file_name: req.file_name,
            file_size: req.file_size,
            total_chunks: req.total_chunks,
            mime_type: req.mime_type,
            target: req.target,
            received: BTreeSet::new(),
            committing: false,
            created_at: Utc::now(),
        };
        kv::put_json(
            self.store.as_ref(),
            &session_key(&token),
            &session,
            Some(self.session_ttl),
        )
        .await?;

        info!(
            upload_id = %token,
            user_id,
            file_size = session.file_size,
            total_chunks = session.total_chunks,
            "upload session started"
        );
        Ok(token)
    }

    /// Stores one chunk and records its index. Re-sending an index overwrites it.
    pub async fn accept_chunk(
        &self,
        user_id: i64,
        token: &str,
        index: u32,
        data: Bytes,
    ) -> IngestResult<ChunkProgress> {
        let session = self.load(user_id, token).await?;
        if index >= session.total_chunks {
            return Err(IngestError::InvalidChunkIndex {
                index,
                total: session.total_chunks,
            });
        }
        if session.committing {
            return Err(committing_error());
        }

        let key = chunk_key(token, index);
        self.blobs.put(&key, data).await?;

        // The object stays on rejection: a committing session already owns
        // every chunk key and removes them itself.
        let updated = kv::update_json::<UploadSession, IngestError, _>(
            self.store.as_ref(),
            &session_key(token),
            |s| {
                if s.committing {
                    return Err(committing_error());
                }
                Ok(s.received.insert(index))
            },
        )
        .await?;

        let Some(session) = updated else {
            // cancelled or expired while the chunk was being written
            if let Err(e) = self.blobs.delete(&key).await {
                warn!(
                    upload_id = %token,
                    chunk = index,
                    error = %e,
                    "failed to remove orphaned chunk"
                );
            }
            return Err(IngestError::SessionNotFound);
        };

        debug!(
            upload_id = %token,
            chunk = index,
            received = session.accepted_count(),
            total = session.total_chunks,
            "chunk accepted"
        );
        Ok(ChunkProgress {
            uploaded_chunks: session.accepted_count(),
            total_chunks: session.total_chunks,
        })
    }

    pub async fn status(&self, user_id: i64, token: &str) -> IngestResult<SessionStatus> {
        let session = self.load(user_id, token).await?;
        Ok(SessionStatus {
            uploaded_chunks: session.accepted_count(),
            total_chunks: session.total_chunks,
            file_name: session.file_name,
            file_size: session.file_size,
        })
    }

    /// Removes the session and its chunks. Unknown sessions are a no-op.
    pub async fn cancel(&self, user_id: i64, token: &str) -> IngestResult<()> {
        let session = match self.load(user_id, token).await {
            Ok(session) => session,
            Err(IngestError::SessionNotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.store.delete(&session_key(token)).await?;
        self.purge_chunks(token, session.total_chunks).await;

        info!(upload_id = %token, user_id, "upload session cancelled");
        Ok(())
    }

    /// Garbage-collects sessions past their TTL. Returns how many were removed.
    pub async fn sweep_expired(&self) -> IngestResult<usize> {
        let expired = self.store.purge_expired(SESSION_KEY_PREFIX).await?;
        let mut removed = 0;

        for (key, raw) in expired {
            match serde_json::from_slice::<UploadSession>(&raw) {
                Ok(session) => {
                    self.purge_chunks(&session.token, session.total_chunks).await;
                    removed += 1;
                }
                Err(e) => warn!(key = %key, error = %e, "undecodable expired session"),
            }
        }

        if removed > 0 {
            info!(removed, "expired upload sessions purged");
        }
        Ok(removed)
    }

    /// Live session owned by `user_id`. Other users' sessions look absent.
    pub(crate) async fn load(&self, user_id: i64, token: &str) -> IngestResult<UploadSession> {
        kv::get_json::<UploadSession>(self.store.as_ref(), &session_key(token))
            .await?
            .map(|v| v.value)
            .filter(|s| s.user_id == user_id)
            .ok_or(IngestError::SessionNotFound)
    }

    /// Bytes freed by committing into `target`. Only the uploader's own
    /// asset can be replaced; a lesson holding someone else's is refused.
    pub(crate) async fn released_bytes(
        &self,
        user_id: i64,
        target: &UploadTarget,
    ) -> IngestResult<u64> {
        let Some(lesson_id) = target.lesson_id() else {
            return Ok(0);
        };
        match self.assets.find_for_lesson(lesson_id).await? {
            None => Ok(0),
            Some(asset) if asset.owner_id == user_id => Ok(asset.byte_size.max(0) as u64),
            Some(_) => Err(IngestError::LessonOwnedByOther(lesson_id)),
        }
    }

    /// Best effort: failures are logged
    pub(crate) async fn purge_chunks(&self, token: &str, total_chunks: u32) {
        for index in 0..total_chunks {
            if let Err(e) = self.blobs.delete(&chunk_key(token, index)).await {
                warn!(upload_id = %token, chunk = index, error = %e, "failed to delete chunk");
            }
        }
    }
}
