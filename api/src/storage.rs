//! Blob storage for chunks, merged assets and extracted audio.
//!
//! Supports two durable backends:
//! - **Local disk**: files under `LOCAL_STORAGE_PATH`
//! - **GCS**: objects in `GCS_BUCKET_NAME` (requires `GOOGLE_APPLICATION_CREDENTIALS`)
//!
//! plus an in-memory store used by tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use google_cloud_storage::client::Storage;
use google_cloud_storage::model_ext::ReadRange;
use sha2::{Digest, Sha256};
#[cfg(test)]
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
#[cfg(test)]
use tokio::sync::Mutex;

const COPY_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("requested range not satisfiable")]
    InvalidRange,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Object contents delivered piece by piece
pub type ByteStream = BoxStream<'static, Result<Bytes, BlobError>>;

/// Result of merging several objects into one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatOutcome {
    pub byte_size: u64,
    /// Lowercase hex SHA-256 of the merged payload
    pub sha256: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or overwrite
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Streams the whole object, or only the inclusive `range` of it
    async fn open(&self, key: &str, range: Option<(u64, u64)>) -> Result<ByteStream, BlobError>;

    async fn exists(&self, key: &str) -> Result<bool, BlobError>;

    /// Deleting a missing object is not an error
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    async fn size(&self, key: &str) -> Result<u64, BlobError>;

    /// Writes `sources` back to back into `dest`. On failure `dest` is removed.
    async fn concat(&self, sources: &[String], dest: &str) -> Result<ConcatOutcome, BlobError>;

    /// Temporary URL a third party can fetch the object from, if supported
    async fn signed_url(&self, _key: &str, _expiry_secs: u32) -> Result<Option<String>, BlobError> {
        Ok(None)
    }

    /// Path on local disk, if the object is directly readable there
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }
}

fn validate_key(key: &str) -> Result<(), BlobError> {
    if key.is_empty() || key.contains("..") || key.contains('\0') || key.starts_with('/') {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn check_range(start: u64, end: u64, len: u64) -> Result<(), BlobError> {
    if start > end || end >= len {
        return Err(BlobError::InvalidRange);
    }
    Ok(())
}

/// Reads `reader` to the end in buffer-sized pieces, stopping at the first error
fn read_stream<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e.into()), None)),
        }
    })
    .boxed()
}

// ============== Local disk ==============

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn not_found(key: &str, e: std::io::Error) -> BlobError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BlobError::NotFound(key.to_string())
    } else {
        BlobError::Io(e)
    }
}

async fn ensure_parent(path: &Path) -> Result<(), BlobError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        ensure_parent(&path).await?;

        // Write then rename so a re-sent chunk never leaves a torn file behind
        let staging = path.with_extension(format!("part{}", rand::random::<u64>()));
        if let Err(e) = tokio::fs::write(&staging, &data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| not_found(key, e))
    }

    async fn open(&self, key: &str, range: Option<(u64, u64)>) -> Result<ByteStream, BlobError> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| not_found(key, e))?;
        let len = file.metadata().await?.len();

        let (start, count) = match range {
            Some((start, end)) => {
                check_range(start, end, len)?;
                (start, end - start + 1)
            }
            None => (0, len),
        };
        file.seek(SeekFrom::Start(start)).await?;
        Ok(read_stream(file.take(count)))
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        // Drop the session directory once its last chunk is gone
        if let Some(parent) = path.parent() {
            if parent != self.root {
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64, BlobError> {
        let path = self.path_for(key)?;
        tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| not_found(key, e))
    }

    async fn concat(&self, sources: &[String], dest: &str) -> Result<ConcatOutcome, BlobError> {
        let dest_path = self.path_for(dest)?;
        ensure_parent(&dest_path).await?;

        let result = async {
            let mut out = tokio::fs::File::create(&dest_path).await?;
            let mut hasher = Sha256::new();
            let mut total = 0u64;
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];

            for source in sources {
                let mut input = tokio::fs::File::open(self.path_for(source)?)
                    .await
                    .map_err(|e| not_found(source, e))?;
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
            }

            out.flush().await?;
            out.sync_all().await?;
            Ok::<_, BlobError>(ConcatOutcome {
                byte_size: total,
                sha256: hex(&hasher.finalize()),
            })
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&dest_path).await;
        }
        result
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.path_for(key).ok()
    }
}

// ============== Google Cloud Storage ==============

/// Merging on GCS buffers the payload in memory before the single write.
pub struct GcsBlobStore {
    gcs: Storage,
    bucket_name: String,
}

impl GcsBlobStore {
    pub fn new(gcs: Storage, bucket_name: impl Into<String>) -> Self {
        Self {
            gcs,
            bucket_name: bucket_name.into(),
        }
    }

    fn bucket(&self) -> String {
        format!("projects/_/buckets/{}", self.bucket_name)
    }

    async fn metadata(&self, key: &str) -> Result<cloud_storage::Object, BlobError> {
        let client = cloud_storage::Client::default();
        client
            .object()
            .read(&self.bucket_name, key)
            .await
            .map_err(|e| BlobError::Backend(format!("GCS metadata read failed: {}", e)))
    }
}

fn gcs_err(context: &str, e: impl std::fmt::Display) -> BlobError {
    BlobError::Backend(format!("{}: {}", context, e))
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        validate_key(key)?;
        self.gcs
            .write_object(&self.bucket(), key, data)
            .send_buffered()
            .await
            .map_err(|e| gcs_err("GCS write failed", e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        validate_key(key)?;
        let mut resp = self
            .gcs
            .read_object(&self.bucket(), key)
            .send()
            .await
            .map_err(|e| gcs_err("GCS read failed", e))?;

        let mut data = BytesMut::new();
        while let Some(chunk) = resp.next().await {
            data.extend_from_slice(&chunk.map_err(|e| gcs_err("GCS stream error", e))?);
        }
        Ok(data.freeze())
    }

    async fn open(&self, key: &str, range: Option<(u64, u64)>) -> Result<ByteStream, BlobError> {
        validate_key(key)?;
        if let Some((start, end)) = range {
            check_range(start, end, self.size(key).await?)?;
        }

        let mut request = self.gcs.read_object(&self.bucket(), key);
        if let Some((start, end)) = range {
            request = request.set_read_range(ReadRange::segment(start, end - start + 1));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| gcs_err("GCS read failed", e))?;
        Ok(stream::unfold(resp, |mut resp| async move {
            let chunk = resp.next().await?;
            Some((chunk.map_err(|e| gcs_err("GCS stream error", e)), resp))
        })
        .boxed())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        validate_key(key)?;
        Ok(self.metadata(key).await.is_ok())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        validate_key(key)?;
        if !self.exists(key).await? {
            return Ok(());
        }
        let client = cloud_storage::Client::default();
        client
            .object()
            .delete(&self.bucket_name, key)
            .await
            .map_err(|e| gcs_err("GCS delete failed", e))
    }

    async fn size(&self, key: &str) -> Result<u64, BlobError> {
        validate_key(key)?;
        Ok(self.metadata(key).await?.size)
    }

    async fn concat(&self, sources: &[String], dest: &str) -> Result<ConcatOutcome, BlobError> {
        validate_key(dest)?;
        let mut merged = BytesMut::new();
        for source in sources {
            merged.extend_from_slice(&self.get(source).await?);
        }
        let merged = merged.freeze();
        let outcome = ConcatOutcome {
            byte_size: merged.len() as u64,
            sha256: hex(&Sha256::digest(&merged)),
        };

        if let Err(e) = self.put(dest, merged).await {
            let _ = self.delete(dest).await;
            return Err(e);
        }
        Ok(outcome)
    }

    async fn signed_url(&self, key: &str, expiry_secs: u32) -> Result<Option<String>, BlobError> {
        let object = self.metadata(key).await?;
        let url = object
            .download_url(expiry_secs)
            .map_err(|e| gcs_err("Signed URL error", e))?;
        Ok(Some(url))
    }
}

// ============== In-memory ==============

#[cfg(test)]
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        validate_key(key)?;
        self.objects.lock().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn open(&self, key: &str, range: Option<(u64, u64)>) -> Result<ByteStream, BlobError> {
        let mut data = self.get(key).await?;
        if let Some((start, end)) = range {
            check_range(start, end, data.len() as u64)?;
            data = data.slice(start as usize..=end as usize);
        }
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    async fn exists(&self, key: &str) -> Result<bool, BlobError> {
        Ok(self.objects.lock().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64, BlobError> {
        Ok(self.get(key).await?.len() as u64)
    }

    async fn concat(&self, sources: &[String], dest: &str) -> Result<ConcatOutcome, BlobError> {
        validate_key(dest)?;
        let mut objects = self.objects.lock().await;
        let mut merged = BytesMut::new();
        for source in sources {
            let data = objects
                .get(source)
                .ok_or_else(|| BlobError::NotFound(source.clone()))?;
            merged.extend_from_slice(data);
        }
        let merged = merged.freeze();
        let outcome = ConcatOutcome {
            byte_size: merged.len() as u64,
            sha256: hex(&Sha256::digest(&merged)),
        };
        objects.insert(dest.to_string(), merged);
        Ok(outcome)
    }
}
