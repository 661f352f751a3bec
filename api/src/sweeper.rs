//! Periodic maintenance using apalis
//!
//! Runs as a scheduled cron job that:
//! - purges expired upload sessions and their chunks
//! - fails transcription jobs whose runner outlived the execution lease
//! - drops finished job records past their retention
//! - forgets idle users in the chunk throttle

use apalis::prelude::*;
use apalis_cron::{CronStream, Schedule};
use apalis_sql::postgres::PostgresStorage;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::domain::jobs::JobStore;
use crate::domain::uploads::UploadSessionManager;
use crate::services::throttle::ChunkThrottle;

const THROTTLE_IDLE: Duration = Duration::from_secs(10 * 60);

/// Job input - marker for one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepJob {
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
}

impl From<chrono::DateTime<chrono::Utc>> for SweepJob {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        SweepJob { scheduled_at: dt }
    }
}

#[derive(Clone)]
pub struct SweepContext {
    pub sessions: Arc<UploadSessionManager>,
    pub jobs: Arc<JobStore>,
    pub throttle: Arc<ChunkThrottle>,
    pub job_lease: chrono::Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_purged: usize,
    pub jobs_reaped: usize,
    pub jobs_expired: usize,
}

/// One maintenance pass. Each part runs even if another fails.
pub async fn sweep_once(ctx: &SweepContext) -> SweepReport {
    let mut report = SweepReport::default();

    match ctx.sessions.sweep_expired().await {
        Ok(n) => report.sessions_purged = n,
        Err(e) => error!(error = %e, "session sweep failed"),
    }

    match ctx.jobs.fail_stale(ctx.job_lease).await {
        Ok(n) => report.jobs_reaped = n,
        Err(e) => error!(error = %e, "stale job sweep failed"),
    }

    match ctx.jobs.purge_expired().await {
        Ok(n) => report.jobs_expired = n,
        Err(e) => error!(error = %e, "job retention sweep failed"),
    }

    let forgotten = ctx.throttle.forget_idle(THROTTLE_IDLE);
    if forgotten > 0 {
        debug!(forgotten, "idle throttle entries dropped");
    }

    report
}

/// Job handler. Always returns Ok so the schedule keeps running.
async fn process_sweep_job(_job: SweepJob, ctx: Data<SweepContext>) -> Result<(), Error> {
    let report = sweep_once(&ctx).await;
    if report != SweepReport::default() {
        info!(
            sessions_purged = report.sessions_purged,
            jobs_reaped = report.jobs_reaped,
            jobs_expired = report.jobs_expired,
            "sweep complete"
        );
    }
    Ok(())
}

/// Start the sweep worker. Returns only on setup failure or shutdown.
pub async fn run_sweeper(
    pool: PgPool,
    ctx: SweepContext,
    cron_seconds: u64,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // apalis job tables
    PostgresStorage::setup(&pool).await?;

    let storage: PostgresStorage<SweepJob> = PostgresStorage::new(pool);
    let schedule = Schedule::from_str(&format!("*/{} * * * * *", cron_seconds))?;
    let backend = CronStream::new(schedule).pipe_to_storage(storage);

    info!(cron_seconds, "sweep worker starting");

    let worker = WorkerBuilder::new("lectern-sweeper")
        .data(ctx)
        .backend(backend)
        .build_fn(process_sweep_job);

    Monitor::new().register(worker).run().await?;
    Ok(())
}
