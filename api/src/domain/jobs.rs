//! Transcription job records and their state machine
//!
//! `pending -> processing -> {completed | failed}`. Terminal jobs never change.
//!
//! Three keys per asset/job:
//! - `transcription_job:{job_id}` the job record
//! - `transcription_active:{asset_id}` id of the asset's pending/processing job
//! - `transcription_latest:{asset_id}` id of the asset's newest job
//!
//! The active index is claimed with put-if-absent (or CAS over a finished job),
//! which is what keeps at most one active job per asset across processes.
//! Finished job records expire after the retention period.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    ACTIVE_JOB_KEY_PREFIX, JOB_KEY_PREFIX, LATEST_JOB_KEY_PREFIX, PROGRESS_COMPLETED,
    PROGRESS_PREPARING,
};
use crate::models::{JobStatus, TranscriptionJob};
use crate::services::error::{IngestError, IngestResult};
use crate::services::kv::{self, KvStore, StoreError};

const MAX_CREATE_ATTEMPTS: usize = 16;

pub const LEASE_EXPIRED_MESSAGE: &str = "job exceeded execution lease";
pub const NEVER_STARTED_MESSAGE: &str = "job was never started";

fn job_key(job_id: &str) -> String {
    format!("{}{}", JOB_KEY_PREFIX, job_id)
}

fn active_key(asset_id: i64) -> String {
    format!("{}{}", ACTIVE_JOB_KEY_PREFIX, asset_id)
}

fn latest_key(asset_id: i64) -> String {
    format!("{}{}", LATEST_JOB_KEY_PREFIX, asset_id)
}

pub struct JobStore {
    store: Arc<dyn KvStore>,
    retention: Duration,
}

impl JobStore {
    pub fn new(store: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self { store, retention }
    }

    pub async fn get(&self, job_id: &str) -> IngestResult<Option<TranscriptionJob>> {
        Ok(kv::get_json(self.store.as_ref(), &job_key(job_id))
            .await?
            .map(|v| v.value))
    }

    /// Returns the asset's active job, or creates one.
    /// The flag is true when a new job was created.
    pub async fn create(
        &self,
        asset_id: i64,
        requester_id: i64,
    ) -> IngestResult<(TranscriptionJob, bool)> {
        let index_key = active_key(asset_id);

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let current = self.store.get(&index_key).await?;

            if let Some(raw) = &current {
                let active_id = String::from_utf8_lossy(raw);
                if let Some(job) = self.get(&active_id).await? {
                    if job.status.is_active() {
                        debug!(job_id = %job.id, asset_id, "returning existing active job");
                        return Ok((job, false));
                    }
                }
            }

            let now = Utc::now();
            let job = TranscriptionJob {
                id: Uuid::new_v4().to_string(),
                asset_id,
                requester_id,
                status: JobStatus::Pending,
                progress: 0,
                current_step: "queued".to_string(),
                result: None,
                error: None,
                created_at: now,
                updated_at: now,
                claimed_at: None,
            };
            let own_key = job_key(&job.id);
            kv::put_json(self.store.as_ref(), &own_key, &job, None).await?;

            let won = match &current {
                None => {
                    self.store
                        .put_if_absent(&index_key, job.id.as_bytes().to_vec(), None)
                        .await?
                }
                Some(raw) => {
                    self.store
                        .compare_and_swap(&index_key, raw, job.id.as_bytes().to_vec())
                        .await?
                }
            };

            if won {
                self.store
                    .put(&latest_key(asset_id), job.id.as_bytes().to_vec(), None)
                    .await?;
                info!(job_id = %job.id, asset_id, requester_id, "transcription job created");
                return Ok((job, true));
            }

            // another caller got there first; re-read its job
            self.store.delete(&own_key).await?;
        }

        Err(StoreError::Contention(index_key).into())
    }

    /// `pending -> processing`. Exactly one caller wins.
    pub async fn claim(&self, job_id: &str) -> IngestResult<TranscriptionJob> {
        kv::update_json::<TranscriptionJob, IngestError, _>(
            self.store.as_ref(),
            &job_key(job_id),
            |job| {
                if job.status != JobStatus::Pending {
                    return Err(IngestError::JobClaimConflict(job_id.to_string()));
                }
                let now = Utc::now();
                job.status = JobStatus::Processing;
                job.progress = job.progress.max(PROGRESS_PREPARING);
                job.current_step = "preparing".to_string();
                job.claimed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            },
        )
        .await?
        .ok_or(IngestError::JobNotFound)
    }

    /// Records step progress. Progress never goes backwards; terminal jobs are left alone.
    pub async fn advance(
        &self,
        job_id: &str,
        progress: u8,
        step: &str,
    ) -> IngestResult<TranscriptionJob> {
        kv::update_json::<TranscriptionJob, IngestError, _>(
            self.store.as_ref(),
            &job_key(job_id),
            |job| {
                if job.status.is_terminal() {
                    return Ok(false);
                }
                job.progress = job.progress.max(progress.min(PROGRESS_COMPLETED));
                job.current_step = step.to_string();
                job.updated_at = Utc::now();
                Ok(true)
            },
        )
        .await?
        .ok_or(IngestError::JobNotFound)
    }

    pub async fn complete(
        &self,
        job_id: &str,
        transcript: String,
    ) -> IngestResult<TranscriptionJob> {
        let job = kv::update_json::<TranscriptionJob, IngestError, _>(
            self.store.as_ref(),
            &job_key(job_id),
            |job| {
                if job.status.is_terminal() {
                    return Ok(false);
                }
                job.status = JobStatus::Completed;
                job.progress = PROGRESS_COMPLETED;
                job.current_step = "completed".to_string();
                job.result = Some(transcript.clone());
                job.updated_at = Utc::now();
                Ok(true)
            },
        )
        .await?
        .ok_or(IngestError::JobNotFound)?;

        self.finish(&job).await;
        Ok(job)
    }

    pub async fn fail(&self, job_id: &str, message: &str) -> IngestResult<TranscriptionJob> {
        let job = kv::update_json::<TranscriptionJob, IngestError, _>(
            self.store.as_ref(),
            &job_key(job_id),
            |job| {
                if job.status.is_terminal() {
                    return Ok(false);
                }
                job.status = JobStatus::Failed;
                job.current_step = "failed".to_string();
                job.error = Some(message.to_string());
                job.updated_at = Utc::now();
                Ok(true)
            },
        )
        .await?
        .ok_or(IngestError::JobNotFound)?;

        self.finish(&job).await;
        Ok(job)
    }

    /// Newest job created for the asset
    pub async fn latest_for_asset(&self, asset_id: i64) -> IngestResult<Option<TranscriptionJob>> {
        let Some(raw) = self.store.get(&latest_key(asset_id)).await? else {
            return Ok(None);
        };
        self.get(&String::from_utf8_lossy(&raw)).await
    }

    /// Fails active jobs whose runner is presumed gone: processing since
    /// before `now - lease`, or still pending that long after creation.
    pub async fn fail_stale(&self, lease: chrono::Duration) -> IngestResult<usize> {
        self.fail_stale_before(Utc::now() - lease).await
    }

    async fn fail_stale_before(&self, cutoff: DateTime<Utc>) -> IngestResult<usize> {
        let mut reaped = 0;

        // only the active index is walked, never the full job history
        for (key, raw_id) in self.store.scan_prefix(ACTIVE_JOB_KEY_PREFIX).await? {
            let job_id = String::from_utf8_lossy(&raw_id).into_owned();
            let job = match self.get(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    // dangling index; the next create replaces it
                    continue;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "undecodable job record");
                    continue;
                }
            };

            let message = match job.status {
                JobStatus::Processing if job.claimed_at.unwrap_or(job.updated_at) < cutoff => {
                    LEASE_EXPIRED_MESSAGE
                }
                JobStatus::Pending if job.created_at < cutoff => NEVER_STARTED_MESSAGE,
                _ => continue,
            };

            self.fail(&job.id, message).await?;
            warn!(
                job_id = %job.id,
                asset_id = job.asset_id,
                error = message,
                "stale transcription job failed"
            );
            reaped += 1;
        }

        Ok(reaped)
    }

    /// Drops finished job records past their retention
    pub async fn purge_expired(&self) -> IngestResult<usize> {
        Ok(self.store.purge_expired(JOB_KEY_PREFIX).await?.len())
    }

    /// Starts the retention clock on a finished job and frees its asset
    async fn finish(&self, job: &TranscriptionJob) {
        if !job.status.is_terminal() {
            return;
        }
        // terminal records never change, so a plain rewrite is safe
        let retained = kv::put_json(
            self.store.as_ref(),
            &job_key(&job.id),
            job,
            Some(self.retention),
        )
        .await;
        if let Err(e) = retained {
            warn!(job_id = %job.id, error = %e, "failed to set job retention");
        }
        self.release_active(job).await;
    }

    /// Frees the asset for a new job, if this job still holds the index
    async fn release_active(&self, job: &TranscriptionJob) {
        if let Err(e) = self
            .store
            .compare_and_delete(&active_key(job.asset_id), job.id.as_bytes())
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to release active job index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PROGRESS_PROCESSING, PROGRESS_UPLOADING};
    use crate::services::kv::MemoryKvStore;
    use std::collections::HashSet;

    fn jobs() -> Arc<JobStore> {
        Arc::new(JobStore::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test]
    async fn test_create_twice_returns_same_job() {
        let jobs = jobs();
        let (first, created) = jobs.create(10, 1).await.unwrap();
        assert!(created);
        assert_eq!(first.status, JobStatus::Pending);

        let (second, created) = jobs.create(10, 2).await.unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_create_yields_one_job() {
        let jobs = jobs();
        let mut handles = Vec::new();
        for requester in 0..16 {
            let jobs = jobs.clone();
            handles.push(tokio::spawn(async move {
                jobs.create(7, requester).await.unwrap().0.id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);

        let records = jobs.store.scan_prefix(JOB_KEY_PREFIX).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_different_assets_get_different_jobs() {
        let jobs = jobs();
        let (a, _) = jobs.create(1, 1).await.unwrap();
        let (b, _) = jobs.create(2, 1).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let jobs = jobs();
        let (job, _) = jobs.create(1, 1).await.unwrap();

        let claimed = jobs.claim(&job.id).await.unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.progress, PROGRESS_PREPARING);
        assert_eq!(claimed.current_step, "preparing");

        let err = jobs.claim(&job.id).await.unwrap_err();
        assert!(matches!(err, IngestError::JobClaimConflict(_)));

        let err = jobs.claim("missing").await.unwrap_err();
        assert!(matches!(err, IngestError::JobNotFound));
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let jobs = jobs();
        let (job, _) = jobs.create(1, 1).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let jobs = jobs.clone();
            let id = job.id.clone();
            handles.push(tokio::spawn(async move { jobs.claim(&id).await.is_ok() }));
        }
        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap() as usize;
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let jobs = jobs();
        let (job, _) = jobs.create(1, 1).await.unwrap();
        jobs.claim(&job.id).await.unwrap();

        jobs.advance(&job.id, PROGRESS_PROCESSING, "processing")
            .await
            .unwrap();
        let job = jobs
            .advance(&job.id, PROGRESS_UPLOADING, "uploading")
            .await
            .unwrap();
        assert_eq!(job.progress, PROGRESS_PROCESSING);
    }

    #[tokio::test]
    async fn test_terminal_state_is_immutable() {
        let jobs = jobs();
        let (job, _) = jobs.create(1, 1).await.unwrap();
        jobs.claim(&job.id).await.unwrap();
        let done = jobs.complete(&job.id, "hello".into()).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result.as_deref(), Some("hello"));

        jobs.advance(&job.id, 10, "uploading").await.unwrap();
        jobs.fail(&job.id, "late failure").await.unwrap();
        let err = jobs.claim(&job.id).await.unwrap_err();
        assert!(matches!(err, IngestError::JobClaimConflict(_)));

        let after = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after, done);
    }

    #[tokio::test]
    async fn test_finished_job_frees_asset_for_new_job() {
        let jobs = jobs();
        let (first, _) = jobs.create(3, 1).await.unwrap();
        jobs.claim(&first.id).await.unwrap();
        jobs.fail(&first.id, "boom").await.unwrap();

        let (second, created) = jobs.create(3, 1).await.unwrap();
        assert!(created);
        assert_ne!(second.id, first.id);

        let latest = jobs.latest_for_asset(3).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        // the failed job is still readable and unchanged
        let old = jobs.get(&first.id).await.unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Failed);
        assert_eq!(old.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_stale_index_is_replaced() {
        let jobs = jobs();
        // index left pointing at a job record that no longer exists
        jobs.store
            .put(&active_key(5), b"ghost".to_vec(), None)
            .await
            .unwrap();

        let (job, created) = jobs.create(5, 1).await.unwrap();
        assert!(created);
        assert_eq!(
            jobs.store.get(&active_key(5)).await.unwrap(),
            Some(job.id.as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn test_latest_for_unknown_asset() {
        assert!(jobs().latest_for_asset(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_processing_jobs_fail() {
        let jobs = jobs();
        let (running, _) = jobs.create(1, 1).await.unwrap();
        jobs.claim(&running.id).await.unwrap();

        assert_eq!(jobs.fail_stale(chrono::Duration::hours(1)).await.unwrap(), 0);

        let reaped = jobs
            .fail_stale_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let running = jobs.get(&running.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Failed);
        assert_eq!(running.error.as_deref(), Some(LEASE_EXPIRED_MESSAGE));
    }

    #[tokio::test]
    async fn test_unclaimed_pending_job_is_reaped_and_asset_freed() {
        let jobs = jobs();
        // created but never picked up by a runner
        let (stuck, _) = jobs.create(4, 1).await.unwrap();

        assert_eq!(jobs.fail_stale(chrono::Duration::hours(1)).await.unwrap(), 0);
        let (same, created) = jobs.create(4, 1).await.unwrap();
        assert!(!created);
        assert_eq!(same.id, stuck.id);

        let reaped = jobs
            .fail_stale_before(Utc::now() + chrono::Duration::days(365))
            .await
            .unwrap();
        assert_eq!(reaped, 1);

        let stuck = jobs.get(&stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Failed);
        assert_eq!(stuck.error.as_deref(), Some(NEVER_STARTED_MESSAGE));

        let (fresh, created) = jobs.create(4, 1).await.unwrap();
        assert!(created);
        assert_ne!(fresh.id, stuck.id);
        assert_eq!(fresh.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_sweep_skips_finished_history() {
        let jobs = jobs();
        let (done, _) = jobs.create(6, 1).await.unwrap();
        jobs.claim(&done.id).await.unwrap();
        jobs.complete(&done.id, "text".into()).await.unwrap();

        let reaped = jobs
            .fail_stale_before(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(reaped, 0);
        assert_eq!(
            jobs.get(&done.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_finished_jobs_expire_after_retention() {
        let jobs = JobStore::new(Arc::new(MemoryKvStore::new()), Duration::from_millis(20));
        let (done, _) = jobs.create(8, 1).await.unwrap();
        jobs.claim(&done.id).await.unwrap();
        jobs.fail(&done.id, "boom").await.unwrap();
        let (active, _) = jobs.create(8, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(jobs.get(&done.id).await.unwrap().is_none());
        assert_eq!(jobs.purge_expired().await.unwrap(), 1);
        // active jobs carry no expiry
        assert_eq!(
            jobs.get(&active.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }
}
