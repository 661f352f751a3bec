//! Background transcription runner
//!
//! A job is dispatched right after it is created and runs detached from the
//! request. The runner claims the job, walks the pipeline steps while
//! recording progress, and finishes in `completed` or `failed`. Failures are
//! never retried.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::constants::{PROGRESS_PROCESSING, PROGRESS_TRANSCRIBING, PROGRESS_UPLOADING};
use crate::domain::assets::AssetRepository;
use crate::domain::jobs::JobStore;
use crate::models::TranscriptionJob;
use crate::services::error::{IngestError, IngestResult};
use crate::services::transcriber::{MediaReference, Transcriber};
use crate::storage::BlobStore;

pub struct JobRunner {
    jobs: Arc<JobStore>,
    assets: Arc<dyn AssetRepository>,
    blobs: Arc<dyn BlobStore>,
    transcriber: Arc<dyn Transcriber>,
    timeout: Duration,
    signed_url_expiry_secs: u32,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<JobStore>,
        assets: Arc<dyn AssetRepository>,
        blobs: Arc<dyn BlobStore>,
        transcriber: Arc<dyn Transcriber>,
        timeout: Duration,
        signed_url_expiry_secs: u32,
    ) -> Self {
        Self {
            jobs,
            assets,
            blobs,
            transcriber,
            timeout,
            signed_url_expiry_secs,
        }
    }

    /// Claims and runs one job to a terminal state
    pub async fn run(&self, job_id: &str) {
        let job = match self.jobs.claim(job_id).await {
            Ok(job) => job,
            Err(IngestError::JobClaimConflict(_)) => {
                debug!(job_id, "job already claimed elsewhere");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to claim job");
                return;
            }
        };

        info!(job_id, asset_id = job.asset_id, "transcription started");

        let outcome = match tokio::time::timeout(self.timeout, self.pipeline(&job)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "transcription timed out after {}s",
                self.timeout.as_secs()
            )),
        };

        let finished = match outcome {
            Ok(transcript) => self.jobs.complete(job_id, transcript).await,
            Err(message) => {
                warn!(job_id, error = %message, "transcription failed");
                self.jobs.fail(job_id, &message).await
            }
        };

        match finished {
            Ok(job) => info!(job_id, status = ?job.status, "transcription finished"),
            Err(e) => error!(job_id, error = %e, "failed to record job outcome"),
        }
    }

    async fn pipeline(&self, job: &TranscriptionJob) -> IngestResult<String> {
        let asset = self
            .assets
            .get(job.asset_id)
            .await?
            .ok_or(IngestError::AssetNotFound)?;

        // extracted audio is much smaller than the source video
        let key = asset.audio_key.as_deref().unwrap_or(&asset.storage_key);
        let media = match self
            .blobs
            .signed_url(key, self.signed_url_expiry_secs)
            .await?
        {
            Some(url) => MediaReference::Url(url),
            None => MediaReference::Bytes(self.blobs.get(key).await?),
        };

        self.jobs
            .advance(&job.id, PROGRESS_UPLOADING, "uploading")
            .await?;
        let media_url = self.transcriber.upload(media).await?;

        self.jobs
            .advance(&job.id, PROGRESS_PROCESSING, "processing")
            .await?;
        let transcript_id = self.transcriber.submit(&media_url).await?;
        self.transcriber.wait_until_ready(&transcript_id).await?;

        self.jobs
            .advance(&job.id, PROGRESS_TRANSCRIBING, "transcribing")
            .await?;
        Ok(self.transcriber.fetch_result(&transcript_id).await?)
    }
}

/// Hands a created job to something that will run it
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, job_id: String);
}

/// Runs each job on its own tokio task
pub struct SpawnDispatcher {
    runner: Arc<JobRunner>,
}

impl SpawnDispatcher {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }
}

impl JobDispatcher for SpawnDispatcher {
    fn dispatch(&self, job_id: String) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            runner.run(&job_id).await;
        });
    }
}
