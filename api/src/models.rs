//! Shared data models used across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a committed upload will be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadTarget {
    /// Replaces the media of one lesson
    Lesson { lesson_id: i64 },
    /// Unattached asset in the shared library
    Library,
}

impl UploadTarget {
    pub fn lesson_id(&self) -> Option<i64> {
        match self {
            UploadTarget::Lesson { lesson_id } => Some(*lesson_id),
            UploadTarget::Library => None,
        }
    }
}

/// Server-side record of one in-flight resumable upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub token: String,
    pub user_id: i64,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub mime_type: String,
    pub target: UploadTarget,
    /// Received chunk indices. Re-adding an index is a no-op.
    pub received: BTreeSet<u32>,
    /// Set while a merge holds the session
    #[serde(default)]
    pub committing: bool,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn accepted_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_chunks as usize
    }
}

/// A committed media record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub owner_id: i64,
    pub storage_key: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub file_name: String,
    pub duration_secs: Option<f64>,
    pub audio_key: Option<String>,
    pub source_url: Option<String>,
    pub lesson_id: Option<i64>,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Asset fields known before the metadata row exists
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub owner_id: i64,
    pub storage_key: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub file_name: String,
    pub duration_secs: Option<f64>,
    pub audio_key: Option<String>,
    pub source_url: Option<String>,
    pub lesson_id: Option<i64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// One enrichment request against one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionJob {
    pub id: String,
    pub asset_id: i64,
    pub requester_id: i64,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Polling view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TranscriptionJob> for JobStatusView {
    fn from(job: &TranscriptionJob) -> Self {
        JobStatusView {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            current_step: job.current_step.clone(),
            transcript: match job.status {
                JobStatus::Completed => job.result.clone(),
                _ => None,
            },
            error: match job.status {
                JobStatus::Failed => job.error.clone(),
                _ => None,
            },
        }
    }
}
