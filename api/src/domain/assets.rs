//! Asset domain - metadata records for committed media
//!
//! Query functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use async_trait::async_trait;
use sqlx::{Executor, PgPool, Postgres};

use crate::models::{Asset, NewAsset};

#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn get(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error>;

    async fn find_for_lesson(&self, lesson_id: i64) -> Result<Option<Asset>, sqlx::Error>;

    /// Creates the asset and detaches the lesson's previous one, atomically.
    /// Only an asset with the same owner is replaced; another owner's asset
    /// makes the insert fail on the lesson's unique index.
    /// Returns the new record and the one it replaced.
    async fn commit(&self, asset: NewAsset) -> Result<(Asset, Option<Asset>), sqlx::Error>;

    async fn set_duration(
        &self,
        asset_id: i64,
        duration_secs: f64,
    ) -> Result<Option<Asset>, sqlx::Error>;

    /// Removes the record, returning it so its objects can be deleted
    async fn delete(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error>;
}

const ASSET_COLUMNS: &str = "id, owner_id, storage_key, byte_size, mime_type, file_name, \
     duration_secs, audio_key, source_url, lesson_id, checksum, created_at";

pub async fn get_asset<'e, E>(executor: E, asset_id: i64) -> Result<Option<Asset>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(&format!("SELECT {} FROM assets WHERE id = $1", ASSET_COLUMNS))
        .bind(asset_id)
        .fetch_optional(executor)
        .await
}

pub async fn get_lesson_asset<'e, E>(
    executor: E,
    lesson_id: i64,
) -> Result<Option<Asset>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "SELECT {} FROM assets WHERE lesson_id = $1",
        ASSET_COLUMNS
    ))
    .bind(lesson_id)
    .fetch_optional(executor)
    .await
}

pub async fn delete_lesson_asset<'e, E>(
    executor: E,
    lesson_id: i64,
    owner_id: i64,
) -> Result<Option<Asset>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(&format!(
        "DELETE FROM assets WHERE lesson_id = $1 AND owner_id = $2 RETURNING {}",
        ASSET_COLUMNS
    ))
    .bind(lesson_id)
    .bind(owner_id)
    .fetch_optional(executor)
    .await
}

pub async fn insert_asset<'e, E>(executor: E, asset: &NewAsset) -> Result<Asset, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(&format!(
        r#"
        INSERT INTO assets (owner_id, storage_key, byte_size, mime_type, file_name,
                            duration_secs, audio_key, source_url, lesson_id, checksum, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
        RETURNING {}
        "#,
        ASSET_COLUMNS
    ))
    .bind(asset.owner_id)
    .bind(&asset.storage_key)
    .bind(asset.byte_size)
    .bind(&asset.mime_type)
    .bind(&asset.file_name)
    .bind(asset.duration_secs)
    .bind(&asset.audio_key)
    .bind(&asset.source_url)
    .bind(asset.lesson_id)
    .bind(&asset.checksum)
    .fetch_one(executor)
    .await
}

#[derive(Clone)]
pub struct PgAssetRepository {
    db: PgPool,
}

impl PgAssetRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AssetRepository for PgAssetRepository {
    async fn get(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error> {
        get_asset(&self.db, asset_id).await
    }

    async fn find_for_lesson(&self, lesson_id: i64) -> Result<Option<Asset>, sqlx::Error> {
        get_lesson_asset(&self.db, lesson_id).await
    }

    async fn commit(&self, asset: NewAsset) -> Result<(Asset, Option<Asset>), sqlx::Error> {
        let mut tx = self.db.begin().await?;

        let replaced = match asset.lesson_id {
            Some(lesson_id) => delete_lesson_asset(&mut *tx, lesson_id, asset.owner_id).await?,
            None => None,
        };
        let created = insert_asset(&mut *tx, &asset).await?;

        tx.commit().await?;
        Ok((created, replaced))
    }

    async fn set_duration(
        &self,
        asset_id: i64,
        duration_secs: f64,
    ) -> Result<Option<Asset>, sqlx::Error> {
        sqlx::query_as(&format!(
            "UPDATE assets SET duration_secs = $2 WHERE id = $1 RETURNING {}",
            ASSET_COLUMNS
        ))
        .bind(asset_id)
        .bind(duration_secs)
        .fetch_optional(&self.db)
        .await
    }

    async fn delete(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error> {
        sqlx::query_as(&format!(
            "DELETE FROM assets WHERE id = $1 RETURNING {}",
            ASSET_COLUMNS
        ))
        .bind(asset_id)
        .fetch_optional(&self.db)
        .await
    }
}

#[cfg(test)]
pub use memory::MemoryAssetRepository;

#[cfg(test)]
mod memory {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryAssetRepository {
        inner: Mutex<(i64, BTreeMap<i64, Asset>)>,
    }

    impl MemoryAssetRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn count(&self) -> usize {
            self.inner.lock().await.1.len()
        }
    }

    #[async_trait]
    impl AssetRepository for MemoryAssetRepository {
        async fn get(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error> {
            Ok(self.inner.lock().await.1.get(&asset_id).cloned())
        }

        async fn find_for_lesson(&self, lesson_id: i64) -> Result<Option<Asset>, sqlx::Error> {
            Ok(self
                .inner
                .lock()
                .await
                .1
                .values()
                .find(|a| a.lesson_id == Some(lesson_id))
                .cloned())
        }

        async fn commit(&self, asset: NewAsset) -> Result<(Asset, Option<Asset>), sqlx::Error> {
            let mut guard = self.inner.lock().await;
            let (next_id, assets) = &mut *guard;

            let current = asset.lesson_id.and_then(|lesson_id| {
                assets
                    .values()
                    .find(|a| a.lesson_id == Some(lesson_id))
                    .map(|a| (a.id, a.owner_id))
            });
            let replaced = match current {
                Some((id, owner_id)) if owner_id == asset.owner_id => assets.remove(&id),
                Some(_) => {
                    return Err(sqlx::Error::Protocol(
                        "duplicate key value violates unique constraint \"assets_lesson_id_idx\""
                            .into(),
                    ));
                }
                None => None,
            };

            *next_id += 1;
            let created = Asset {
                id: *next_id,
                owner_id: asset.owner_id,
                storage_key: asset.storage_key,
                byte_size: asset.byte_size,
                mime_type: asset.mime_type,
                file_name: asset.file_name,
                duration_secs: asset.duration_secs,
                audio_key: asset.audio_key,
                source_url: asset.source_url,
                lesson_id: asset.lesson_id,
                checksum: asset.checksum,
                created_at: Utc::now(),
            };
            assets.insert(created.id, created.clone());
            Ok((created, replaced))
        }

        async fn set_duration(
            &self,
            asset_id: i64,
            duration_secs: f64,
        ) -> Result<Option<Asset>, sqlx::Error> {
            let mut guard = self.inner.lock().await;
            Ok(guard.1.get_mut(&asset_id).map(|a| {
                a.duration_secs = Some(duration_secs);
                a.clone()
            }))
        }

        async fn delete(&self, asset_id: i64) -> Result<Option<Asset>, sqlx::Error> {
            Ok(self.inner.lock().await.1.remove(&asset_id))
        }
    }
}
