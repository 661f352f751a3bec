//! Turns a fully received upload session into a committed asset
//!
//! Order of operations:
//! 1. hold the session (`committing`) once every chunk index is recorded
//! 2. confirm each chunk object exists and total their real sizes
//! 3. re-run quota admission with the real size, crediting the replaced asset
//! 4. concatenate chunks in index order into a fresh key
//! 5. run optional probes (duration, audio track); failures are logged only
//! 6. insert the asset row and detach the previous one in one transaction
//! 7. delete the replaced objects, then the session, then the chunks
//!
//! Any failure before step 6 completes removes the objects written so far.

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::get_extension;
use crate::domain::uploads::{UploadSessionManager, chunk_key, session_key};
use crate::models::{Asset, NewAsset, UploadSession};
use crate::services::error::{IngestError, IngestResult};
use crate::services::kv;
use crate::services::plans;
use crate::services::probe::{MediaProbe, ProbeError};

/// Result of one optional post-merge step
enum Enrichment {
    Duration(f64),
    AudioTrack(String),
}

pub struct MergeCommitter {
    sessions: Arc<UploadSessionManager>,
    probe: Option<Arc<dyn MediaProbe>>,
}

impl MergeCommitter {
    pub fn new(sessions: Arc<UploadSessionManager>, probe: Option<Arc<dyn MediaProbe>>) -> Self {
        Self { sessions, probe }
    }

    pub async fn complete(&self, user_id: i64, token: &str) -> IngestResult<Asset> {
        let session = self.hold(user_id, token).await?;

        match self.merge(&session).await {
            Ok(asset) => {
                self.finish(&session).await;
                Ok(asset)
            }
            Err(e) => {
                self.release(token).await;
                Err(e)
            }
        }
    }

    /// Marks the session as being committed so a concurrent call backs off
    async fn hold(&self, user_id: i64, token: &str) -> IngestResult<UploadSession> {
        // ownership and existence
        self.sessions.load(user_id, token).await?;

        kv::update_json::<UploadSession, IngestError, _>(
            self.sessions.store.as_ref(),
            &session_key(token),
            |s| {
                if !s.is_complete() {
                    return Err(IngestError::IncompleteUpload {
                        received: s.accepted_count(),
                        total: s.total_chunks,
                    });
                }
                if s.committing {
                    return Err(IngestError::InvalidRequest(
                        "upload is already being committed".into(),
                    ));
                }
                s.committing = true;
                Ok(true)
            },
        )
        .await?
        .ok_or(IngestError::SessionNotFound)
    }

    async fn release(&self, token: &str) {
        let result = kv::update_json::<UploadSession, IngestError, _>(
            self.sessions.store.as_ref(),
            &session_key(token),
            |s| {
                s.committing = false;
                Ok(true)
            },
        )
        .await;
        if let Err(e) = result {
            warn!(upload_id = %token, error = %e, "failed to release upload session");
        }
    }

    async fn merge(&self, session: &UploadSession) -> IngestResult<Asset> {
        let blobs = &self.sessions.blobs;

        let mut sources = Vec::with_capacity(session.total_chunks as usize);
        let mut stored_bytes = 0u64;
        for index in 0..session.total_chunks {
            let key = chunk_key(&session.token, index);
            if !blobs.exists(&key).await? {
                return Err(IngestError::MissingChunk(index));
            }
            stored_bytes += blobs.size(&key).await?;
            sources.push(key);
        }

        let released = self
            .sessions
            .released_bytes(session.user_id, &session.target)
            .await?;
        plans::admit(
            self.sessions.plans.as_ref(),
            session.user_id,
            released,
            stored_bytes,
        )
        .await?;

        let storage_key = format!(
            "assets/user_{}/{}/{}.{}",
            session.user_id,
            Utc::now().format("%Y-%m-%d"),
            Uuid::new_v4(),
            get_extension(&session.mime_type)
        );

        let outcome = match blobs.concat(&sources, &storage_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard(&[storage_key.as_str()]).await;
                return Err(e.into());
            }
        };
        if outcome.byte_size != stored_bytes {
            self.discard(&[storage_key.as_str()]).await;
            return Err(IngestError::SizeMismatch {
                expected: stored_bytes,
                actual: outcome.byte_size,
            });
        }

        let mut asset = NewAsset {
            owner_id: session.user_id,
            storage_key: storage_key.clone(),
            byte_size: outcome.byte_size as i64,
            mime_type: session.mime_type.clone(),
            file_name: session.file_name.clone(),
            duration_secs: None,
            audio_key: None,
            source_url: None,
            lesson_id: session.target.lesson_id(),
            checksum: Some(outcome.sha256),
        };
        self.enrich(&mut asset, &session.token).await;

        let (created, replaced) = match self.sessions.assets.commit(asset.clone()).await {
            Ok(result) => result,
            Err(e) => {
                let mut written = vec![asset.storage_key.as_str()];
                written.extend(asset.audio_key.as_deref());
                self.discard(&written).await;
                return Err(e.into());
            }
        };

        if let Some(previous) = replaced {
            let mut stale = vec![previous.storage_key.as_str()];
            stale.extend(previous.audio_key.as_deref());
            self.discard(&stale).await;
            info!(asset_id = previous.id, "replaced asset removed");
        }

        info!(
            upload_id = %session.token,
            asset_id = created.id,
            user_id = session.user_id,
            byte_size = created.byte_size,
            "upload committed"
        );
        Ok(created)
    }

    /// Runs the optional probes. A failed step leaves its field empty.
    async fn enrich(&self, asset: &mut NewAsset, token: &str) {
        let Some(probe) = &self.probe else {
            return;
        };
        let key = asset.storage_key.clone();

        let steps: Vec<(&str, BoxFuture<'_, Result<Enrichment, ProbeError>>)> = vec![
            (
                "duration",
                async { probe.probe_duration(&key).await.map(Enrichment::Duration) }.boxed(),
            ),
            (
                "audio_track",
                async {
                    probe
                        .extract_audio_track(&key)
                        .await
                        .map(Enrichment::AudioTrack)
                }
                .boxed(),
            ),
        ];

        for (name, step) in steps {
            match step.await {
                Ok(Enrichment::Duration(secs)) => asset.duration_secs = Some(secs),
                Ok(Enrichment::AudioTrack(audio_key)) => asset.audio_key = Some(audio_key),
                Err(e) => {
                    warn!(upload_id = %token, step = name, error = %e, "optional media step failed")
                }
            }
        }
    }

    /// Session cleanup after a successful commit. The record goes first so a
    /// chunk arriving from here on finds no session and removes its own object.
    async fn finish(&self, session: &UploadSession) {
        if let Err(e) = self.sessions.store.delete(&session_key(&session.token)).await {
            warn!(upload_id = %session.token, error = %e, "failed to delete committed session");
        }
        self.sessions
            .purge_chunks(&session.token, session.total_chunks)
            .await;
    }

    async fn discard(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.sessions.blobs.delete(key).await {
                warn!(key = %key, error = %e, "failed to delete object");
            }
        }
    }
}
