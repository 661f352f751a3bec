//! Key-value store for upload session and transcription job records.
//!
//! Every mutation of a shared record goes through a single-key
//! compare-and-swap, so coordination works across processes as long as the
//! backing store provides it. Two backends:
//! - `PgKvStore`: the `kv_entries` table
//! - `MemoryKvStore`: a process-local map used by tests

use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use sqlx::PgPool;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::time::Instant;
use std::time::Duration;
use thiserror::Error;
#[cfg(test)]
use tokio::sync::Mutex;

/// CAS retries before giving up on a hot key
const MAX_CAS_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("too much contention on key {0}")]
    Contention(String),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Live (non-expired) value for `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditional write. `ttl = None` never expires.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), StoreError>;

    /// Writes only when no live value exists. Returns whether it wrote.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Replaces the live value iff it still equals `expected`. Keeps the
    /// existing expiry.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StoreError>;

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

    /// Idempotent
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Live entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Removes and returns expired entries under `prefix`
    async fn purge_expired(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// A decoded record plus the exact bytes it was read from, for CAS
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub raw: Vec<u8>,
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<Versioned<T>>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(Versioned {
            value: serde_json::from_slice(&raw)?,
            raw,
        })),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    store.put(key, serde_json::to_vec(value)?, ttl).await
}

/// Read-modify-write loop over one record.
///
/// `apply` returns `Ok(true)` to persist its change, `Ok(false)` to leave the
/// record untouched. Returns `None` when the key does not exist.
pub async fn update_json<T, E, F>(
    store: &dyn KvStore,
    key: &str,
    mut apply: F,
) -> Result<Option<T>, E>
where
    T: Serialize + DeserializeOwned,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<bool, E>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(current) = get_json::<T>(store, key).await? else {
            return Ok(None);
        };

        let mut value = current.value;
        if !apply(&mut value)? {
            return Ok(Some(value));
        }

        let encoded = serde_json::to_vec(&value).map_err(StoreError::from)?;
        if store.compare_and_swap(key, &current.raw, encoded).await? {
            return Ok(Some(value));
        }
    }

    Err(StoreError::Contention(key.to_string()).into())
}

// ============== In-memory backend ==============

#[cfg(test)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

#[cfg(test)]
impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

#[cfg(test)]
impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.value = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == expected)
        {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn purge_expired(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();

        Ok(expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
            .collect())
    }
}

// ============== Postgres backend ==============

#[derive(Clone)]
pub struct PgKvStore {
    db: PgPool,
}

impl PgKvStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn expiry(ttl: Option<Duration>) -> Result<Option<chrono::DateTime<Utc>>, StoreError> {
    ttl.map(|t| {
        chrono::Duration::from_std(t)
            .map(|d| Utc::now() + d)
            .map_err(|e| StoreError::InvalidTtl(e.to_string()))
    })
    .transpose()
}

#[async_trait]
impl KvStore for PgKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT value FROM kv_entries
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl)?)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        // An expired row counts as absent and is overwritten in place
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expiry(ttl)?)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE kv_entries SET value = $3
            WHERE key = $1 AND value = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = $1 AND value = $2")
            .bind(key)
            .bind(expected)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        // left() instead of LIKE: prefixes contain '_'
        Ok(sqlx::query_as(
            r#"
            SELECT key, value FROM kv_entries
            WHERE left(key, length($1)) = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?)
    }

    async fn purge_expired(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(sqlx::query_as(
            r#"
            DELETE FROM kv_entries
            WHERE left(key, length($1)) = $1
              AND expires_at IS NOT NULL AND expires_at <= NOW()
            RETURNING key, value
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Counter {
        n: u32,
    }

    #[tokio::test]
    async fn test_put_if_absent_only_once() {
        let store = MemoryKvStore::new();
        assert!(store.put_if_absent("k", b"a".to_vec(), None).await.unwrap());
        assert!(!store.put_if_absent("k", b"b".to_vec(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap_requires_match() {
        let store = MemoryKvStore::new();
        store.put("k", b"v1".to_vec(), None).await.unwrap();
        assert!(!store.compare_and_swap("k", b"nope", b"v2".to_vec()).await.unwrap());
        assert!(store.compare_and_swap("k", b"v1", b"v2".to_vec()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
        assert!(!store.compare_and_swap("missing", b"v1", b"v2".to_vec()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_hidden_then_purged() {
        let store = MemoryKvStore::new();
        store
            .put("s:1", b"x".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.put("s:2", b"y".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("s:1").await.unwrap(), None);
        assert_eq!(store.scan_prefix("s:").await.unwrap().len(), 1);

        let purged = store.purge_expired("s:").await.unwrap();
        assert_eq!(purged, vec![("s:1".to_string(), b"x".to_vec())]);
        assert!(store.purge_expired("s:").await.unwrap().is_empty());
        // an expired key can be claimed again
        assert!(store.put_if_absent("s:1", b"z".to_vec(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_json_serializes_concurrent_writers() {
        let store = std::sync::Arc::new(MemoryKvStore::new());
        put_json(store.as_ref(), "c", &Counter { n: 0 }, None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                update_json::<Counter, StoreError, _>(store.as_ref(), "c", |c| {
                    c.n += 1;
                    Ok(true)
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let counter = get_json::<Counter>(store.as_ref(), "c").await.unwrap().unwrap();
        assert_eq!(counter.value, Counter { n: 16 });
    }

    #[tokio::test]
    async fn test_update_json_missing_key() {
        let store = MemoryKvStore::new();
        let r = update_json::<Counter, StoreError, _>(&store, "nope", |_| Ok(true))
            .await
            .unwrap();
        assert!(r.is_none());
    }
}
