//! Subscription storage limits and current usage per user

use async_trait::async_trait;
use sqlx::PgPool;

use crate::constants::UNLIMITED;
use crate::domain::quota::{QuotaLedger, bytes_to_mb, check_admission};
use crate::services::error::IngestResult;

#[async_trait]
pub trait PlanLookup: Send + Sync {
    /// Storage ceiling in MB, or `UNLIMITED`
    async fn max_storage_mb(&self, user_id: i64) -> Result<i64, sqlx::Error>;

    /// MB currently counted against the user
    async fn current_usage_mb(&self, user_id: i64) -> Result<i64, sqlx::Error>;
}

/// Looks up the user's plan and runs admission for `incoming_bytes`,
/// crediting back `released_bytes` of storage about to be replaced.
pub async fn admit(
    plans: &dyn PlanLookup,
    user_id: i64,
    released_bytes: u64,
    incoming_bytes: u64,
) -> IngestResult<QuotaLedger> {
    let limit_mb = plans.max_storage_mb(user_id).await?;
    let used_mb = plans.current_usage_mb(user_id).await?;
    let ledger = check_admission(
        limit_mb,
        used_mb,
        bytes_to_mb(released_bytes),
        bytes_to_mb(incoming_bytes),
    )?;

    tracing::debug!(
        user_id,
        used_mb = ledger.current_used_mb,
        projected_mb = ledger.projected_mb,
        limit_mb,
        "quota admitted"
    );
    Ok(ledger)
}

/// Limits from `storage_plans`, usage summed over the user's assets.
/// Users without a plan row are unlimited.
#[derive(Clone)]
pub struct PgPlanLookup {
    db: PgPool,
}

impl PgPlanLookup {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PlanLookup for PgPlanLookup {
    async fn max_storage_mb(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT max_storage_mb FROM storage_plans WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|r| r.0).unwrap_or(UNLIMITED))
    }

    async fn current_usage_mb(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        let (bytes,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(byte_size), 0)::BIGINT FROM assets WHERE owner_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;
        Ok(bytes_to_mb(bytes.max(0) as u64))
    }
}

/// Same limit and usage for every user
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedPlan {
    pub limit_mb: i64,
    pub used_mb: i64,
}

#[cfg(test)]
#[async_trait]
impl PlanLookup for FixedPlan {
    async fn max_storage_mb(&self, _user_id: i64) -> Result<i64, sqlx::Error> {
        Ok(self.limit_mb)
    }

    async fn current_usage_mb(&self, _user_id: i64) -> Result<i64, sqlx::Error> {
        Ok(self.used_mb)
    }
}
